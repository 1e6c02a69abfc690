// Update job: one time-bounded refresh pass over every cache candidate

use crate::cache::{CacheCandidate, DataStore};
use crate::errors::{CacheUpdateError, JobError, StoreError};
use crate::jobs::{
    sweep_stale_lock, Job, JobKind, JobName, LockAgePolicy, SchedulerContext, UpdateRun,
};
use crate::scheduler::Trigger;
use crate::telemetry;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

/// What the refresh worker managed to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub updated: Vec<String>,
    pub failed: Vec<String>,
    /// The worker stopped early on a cancellation request
    pub cancelled: bool,
}

/// Outcome of one update job firing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Another update holds the lock
    Skipped,
    Completed(PassReport),
    TimedOut,
    Cancelled,
    /// The store could not serve the pass; a retry may have been scheduled
    Failed { reason: String },
}

impl UpdateOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateOutcome::Skipped => "skipped",
            UpdateOutcome::Completed(_) => "completed",
            UpdateOutcome::TimedOut => "timed_out",
            UpdateOutcome::Cancelled => "cancelled",
            UpdateOutcome::Failed { .. } => "failed",
        }
    }
}

/// Failures that end a pass early
#[derive(Debug)]
enum PassFailure {
    Store(StoreError),
    Fatal {
        candidate: String,
        error: CacheUpdateError,
    },
}

/// Refreshes every candidate of its scheduler while holding the lock.
///
/// The refresh itself runs on a blocking worker thread. The firing task only
/// supervises it against the configured budget, so a stuck candidate can
/// never keep the lock held past that budget.
pub struct UpdateJob {
    name: JobName,
    ctx: Arc<SchedulerContext>,
    rescheduling_allowed: bool,
    stale_lock_sweep: Option<LockAgePolicy>,
    last_run: Mutex<Option<Arc<UpdateRun>>>,
}

impl UpdateJob {
    pub fn new(ctx: Arc<SchedulerContext>, rescheduling_allowed: bool) -> Self {
        Self {
            name: JobName::unique("update"),
            ctx,
            rescheduling_allowed,
            stale_lock_sweep: None,
            last_run: Mutex::new(None),
        }
    }

    /// Sweep the lock under `policy` before trying to acquire it
    pub fn with_stale_lock_sweep(mut self, policy: LockAgePolicy) -> Self {
        self.stale_lock_sweep = Some(policy);
        self
    }

    /// The single follow-up for a failed pass; never reschedules itself
    fn retry(&self) -> Self {
        UpdateJob::new(Arc::clone(&self.ctx), false).with_stale_lock_sweep(LockAgePolicy::MaxAge(
            self.ctx.options.monitor_max_lock_age(),
        ))
    }

    pub fn rescheduling_allowed(&self) -> bool {
        self.rescheduling_allowed
    }

    /// Whether the refresh worker of the latest pass has really returned.
    ///
    /// The lock is released on timeout even if a candidate ignores
    /// cancellation; this stays false until that worker is gone.
    pub fn is_actually_stopped(&self) -> bool {
        self.last_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |run| run.is_actually_stopped())
    }

    /// Run one pass and report how it ended.
    ///
    /// Only fatal candidate errors and lock I/O errors are returned as `Err`;
    /// the lock is released before returning on every path.
    #[instrument(
        skip(self),
        fields(job = %self.name, rescheduling_allowed = self.rescheduling_allowed)
    )]
    pub async fn run_pass(&self) -> Result<UpdateOutcome, JobError> {
        let run = Arc::new(UpdateRun::new(
            self.name.clone(),
            Arc::clone(&self.ctx.candidates),
        ));
        let _registration = self.ctx.in_flight.register(Arc::clone(&run));
        self.ctx.mark_update_launched();

        if let Some(policy) = self.stale_lock_sweep {
            sweep_stale_lock(&self.ctx.lock, policy, self.ctx.has_launched_update());
        }

        if run.is_cancelled() || self.ctx.engine.is_shut_down() {
            info!("Scheduler shutting down, cache update not started");
            telemetry::record_update_outcome(UpdateOutcome::Cancelled.label());
            return Ok(UpdateOutcome::Cancelled);
        }

        let Some(guard) = self.ctx.lock.try_acquire_guard()? else {
            info!(
                lock_path = %self.ctx.lock.path().display(),
                "Cache update locked, skipping"
            );
            telemetry::record_update_outcome(UpdateOutcome::Skipped.label());
            return Ok(UpdateOutcome::Skipped);
        };

        let started = Instant::now();
        let worker = self.spawn_worker(&run);
        let result = self.supervise(&run, worker).await;
        let elapsed = started.elapsed();

        if let Err(e) = guard.release() {
            error!(error = %e, "Failed to release cache update lock");
        }
        telemetry::record_update_duration(elapsed);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, elapsed_ms = elapsed.as_millis() as u64, "Cache update aborted");
                telemetry::record_update_outcome("fatal");
                return Err(e);
            }
        };
        telemetry::record_update_outcome(outcome.label());

        match &outcome {
            UpdateOutcome::Completed(report) => info!(
                updated = report.updated.len(),
                failed = report.failed.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Cache update completed"
            ),
            UpdateOutcome::Failed { reason } => self.schedule_retry(reason),
            _ => {}
        }

        Ok(outcome)
    }

    fn spawn_worker(&self, run: &Arc<UpdateRun>) -> JoinHandle<Result<PassReport, PassFailure>> {
        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(run));

        let stop_guard = run.worker_started();
        let store = Arc::clone(&self.ctx.store);
        let candidates = Arc::clone(&self.ctx.candidates);
        let token = run.cancellation_token();
        let span = Span::current();

        tokio::task::spawn_blocking(move || {
            let _stop_guard = stop_guard;
            let _entered = span.enter();
            refresh_candidates(store.as_ref(), &candidates, &token)
        })
    }

    /// Wait for the worker, polling until the budget runs out
    async fn supervise(
        &self,
        run: &UpdateRun,
        mut worker: JoinHandle<Result<PassReport, PassFailure>>,
    ) -> Result<UpdateOutcome, JobError> {
        let options = &self.ctx.options;
        let started = Instant::now();
        // A budget past the clock's range never expires
        let deadline = started.checked_add(options.update_timeout);
        let token = run.cancellation_token();

        loop {
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                warn!(
                    timeout_secs = options.update_timeout.as_secs(),
                    "Cache update timed out, cancelling"
                );
                run.cancel();
                worker.abort();
                return Ok(UpdateOutcome::TimedOut);
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Cache update cancelled");
                    return Ok(UpdateOutcome::Cancelled);
                }
                joined = &mut worker => return self.finish(joined),
                _ = sleep(poll_delay(options.supervisor_poll_interval, deadline, now)) => {
                    debug!(
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Cache update still running"
                    );
                }
            }
        }
    }

    fn finish(
        &self,
        joined: Result<Result<PassReport, PassFailure>, JoinError>,
    ) -> Result<UpdateOutcome, JobError> {
        match joined {
            Ok(Ok(report)) if report.cancelled => {
                info!(updated = report.updated.len(), "Cache update stopped on request");
                Ok(UpdateOutcome::Cancelled)
            }
            Ok(Ok(report)) => Ok(UpdateOutcome::Completed(report)),
            Ok(Err(PassFailure::Store(e))) => Ok(UpdateOutcome::Failed {
                reason: e.to_string(),
            }),
            Ok(Err(PassFailure::Fatal { candidate, error })) => Err(JobError::Fatal(format!(
                "candidate {} failed: {}",
                candidate, error
            ))),
            Err(e) if e.is_panic() => Err(JobError::Fatal("refresh worker panicked".to_string())),
            Err(e) => Err(JobError::Fatal(format!("refresh worker lost: {}", e))),
        }
    }

    fn schedule_retry(&self, reason: &str) {
        if !self.rescheduling_allowed {
            error!(
                reason = reason,
                "Cache update failed again, waiting for the next daily update"
            );
            return;
        }

        let backoff = self.ctx.options.retry_backoff;
        let retry = Arc::new(self.retry());
        let retry_name = retry.name().clone();
        match self.ctx.engine.schedule(retry, Trigger::after(backoff)) {
            Ok(()) => warn!(
                reason = reason,
                retry_job = %retry_name,
                backoff_secs = backoff.as_secs(),
                "Cache update failed, retry scheduled"
            ),
            Err(e) => error!(
                reason = reason,
                error = %e,
                "Cache update failed and the retry could not be scheduled"
            ),
        }
    }
}

#[async_trait]
impl Job for UpdateJob {
    fn name(&self) -> &JobName {
        &self.name
    }

    fn kind(&self) -> JobKind {
        JobKind::Update {
            rescheduling_allowed: self.rescheduling_allowed,
        }
    }

    async fn run(&self) -> Result<(), JobError> {
        self.run_pass().await.map(|_| ())
    }

    fn cancel(&self) {
        let cancelled = self.ctx.in_flight.cancel_job(&self.name);
        debug!(job = %self.name, runs = cancelled, "Cancel requested");
    }
}

fn poll_delay(poll_interval: Duration, deadline: Option<Instant>, now: Instant) -> Duration {
    deadline.map_or(poll_interval, |deadline| {
        poll_interval.min(deadline.saturating_duration_since(now))
    })
}

/// Body of the refresh worker.
///
/// Recoverable candidate errors are logged and the pass moves on to the next
/// candidate; an unexpected error ends the pass.
fn refresh_candidates(
    store: &dyn DataStore,
    candidates: &[Arc<dyn CacheCandidate>],
    cancel: &CancellationToken,
) -> Result<PassReport, PassFailure> {
    store.probe().map_err(PassFailure::Store)?;

    let mut report = PassReport::default();
    for candidate in candidates {
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let name = candidate.name();
        match candidate.update_from_store(store) {
            Ok(()) => {
                debug!(candidate = name, "Cache candidate refreshed");
                report.updated.push(name.to_string());
            }
            Err(e) if e.is_recoverable() => {
                warn!(candidate = name, error = %e, "Cache candidate refresh failed");
                telemetry::record_candidate_failure(name);
                report.failed.push(name.to_string());
            }
            Err(e) => {
                return Err(PassFailure::Fatal {
                    candidate: name.to_string(),
                    error: e,
                })
            }
        }
    }

    Ok(report)
}
