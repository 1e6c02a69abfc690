// Common library: cache refresh scheduling shared by the binary and integration tests

pub mod cache;
pub mod cache_scheduler;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod lock;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod telemetry;

pub use cache::{CacheCandidate, CacheStatus, CandidateStatus, DataStore};
pub use cache_scheduler::{CacheScheduler, ForceUpdate, SchedulerOptions};
pub use lock::{LockFileGuard, LockFileManager, LockOwner};
pub use schedule::resolve_next_run;
