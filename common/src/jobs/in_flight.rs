// In-flight update tracking for cooperative cancellation at shutdown

use crate::cache::CacheCandidate;
use crate::jobs::JobName;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// One firing of an update job.
///
/// Owns the cancellation signal seen by the refresh worker and reports
/// whether that worker has really returned.
pub struct UpdateRun {
    id: Uuid,
    job: JobName,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    worker_stopped: AtomicBool,
    candidates: Arc<[Arc<dyn CacheCandidate>]>,
}

impl UpdateRun {
    pub fn new(job: JobName, candidates: Arc<[Arc<dyn CacheCandidate>]>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            worker_stopped: AtomicBool::new(true),
            candidates,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn job(&self) -> &JobName {
        &self.job
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal the worker and ask every candidate to abandon its refresh.
    /// Repeated calls are no-ops.
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        for candidate in self.candidates.iter() {
            candidate.cancel_in_flight_update();
        }
        info!(job = %self.job, run_id = %self.id, "Update run cancelled");
    }

    /// False while a refresh worker launched by this run is still executing,
    /// even after the run itself was cancelled or timed out.
    pub fn is_actually_stopped(&self) -> bool {
        self.worker_stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn worker_started(self: &Arc<Self>) -> WorkerStopGuard {
        self.worker_stopped.store(false, Ordering::SeqCst);
        WorkerStopGuard {
            run: Arc::clone(self),
        }
    }

    pub fn snapshot(&self) -> InFlightUpdate {
        InFlightUpdate {
            job: self.job.clone(),
            run_id: self.id,
            started_at: self.started_at,
            cancelled: self.is_cancelled(),
            worker_stopped: self.is_actually_stopped(),
        }
    }
}

/// Moved into the refresh worker; marks the run stopped when the worker
/// returns or unwinds.
pub(crate) struct WorkerStopGuard {
    run: Arc<UpdateRun>,
}

impl Drop for WorkerStopGuard {
    fn drop(&mut self) {
        self.run.worker_stopped.store(true, Ordering::SeqCst);
        debug!(run_id = %self.run.id, "Refresh worker stopped");
    }
}

/// Operator view of an in-flight update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InFlightUpdate {
    pub job: JobName,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    pub worker_stopped: bool,
}

/// Update runs currently executing, keyed by run id.
///
/// Runs insert themselves on entry and remove themselves on exit; shutdown
/// drains whatever is left. Each operation holds the lock only for a single
/// map access.
#[derive(Default)]
pub struct InFlightJobs {
    runs: Mutex<HashMap<Uuid, Arc<UpdateRun>>>,
}

impl InFlightJobs {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<UpdateRun>>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track `run` until the returned registration is dropped
    pub fn register(&self, run: Arc<UpdateRun>) -> InFlightRegistration<'_> {
        let id = run.id();
        self.runs().insert(id, run);
        InFlightRegistration { jobs: self, id }
    }

    /// Take every tracked run; later deregistrations of these runs are no-ops
    pub fn drain(&self) -> Vec<Arc<UpdateRun>> {
        self.runs().drain().map(|(_, run)| run).collect()
    }

    /// Cancel the runs belonging to `job`
    pub fn cancel_job(&self, job: &JobName) -> usize {
        let runs: Vec<Arc<UpdateRun>> = self
            .runs()
            .values()
            .filter(|run| run.job() == job)
            .cloned()
            .collect();
        for run in &runs {
            run.cancel();
        }
        runs.len()
    }

    pub fn len(&self) -> usize {
        self.runs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs().is_empty()
    }

    /// Snapshot ordered by start time
    pub fn snapshot(&self) -> Vec<InFlightUpdate> {
        let mut updates: Vec<InFlightUpdate> =
            self.runs().values().map(|run| run.snapshot()).collect();
        updates.sort_by_key(|update| update.started_at);
        updates
    }
}

/// Removes its run from the in-flight set on drop
pub struct InFlightRegistration<'a> {
    jobs: &'a InFlightJobs,
    id: Uuid,
}

impl Drop for InFlightRegistration<'_> {
    fn drop(&mut self) {
        self.jobs.runs().remove(&self.id);
    }
}
