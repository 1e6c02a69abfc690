// Scheduling engine: timer-driven triggers dispatching registered jobs

pub mod engine;
pub mod registry;
pub mod trigger;

pub use engine::SchedulingEngine;
pub use registry::{JobRegistry, RegisteredJob, RegisteredJobInfo};
pub use trigger::Trigger;
