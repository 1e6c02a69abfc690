// Jobs fired by the scheduling engine: cache refresh and stale lock monitoring

pub mod context;
pub mod in_flight;
pub mod monitor;
pub mod update;

pub use context::SchedulerContext;
pub use in_flight::{InFlightJobs, InFlightRegistration, InFlightUpdate, UpdateRun};
pub use monitor::{sweep_stale_lock, LockAgePolicy, MonitorJob, StaleLockCheck};
pub use update::{PassReport, UpdateJob, UpdateOutcome};

use crate::errors::JobError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Unique, opaque job name, stable for the lifetime of the job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobName(String);

impl JobName {
    /// Fresh name of the form `<prefix>-<uuid>`
    pub fn unique(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// What a registered job does, for registry inspection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Update { rescheduling_allowed: bool },
    Monitor,
}

/// A named, cancellable unit of scheduled work
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &JobName;

    fn kind(&self) -> JobKind;

    /// Execute one firing. Called on a runtime worker, never on a timer task.
    async fn run(&self) -> Result<(), JobError>;

    /// Request cooperative cancellation of any firing in progress
    fn cancel(&self);
}
