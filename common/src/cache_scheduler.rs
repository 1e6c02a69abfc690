// Cache scheduler: wires update and monitor jobs onto the scheduling engine

use crate::cache::{CacheCandidate, CacheStatus, CandidateStatus, DataStore};
use crate::errors::SchedulingError;
use crate::jobs::{
    InFlightUpdate, Job, JobName, LockAgePolicy, MonitorJob, SchedulerContext, UpdateJob,
    UpdateRun,
};
use crate::lock::LockFileManager;
use crate::schedule::{delay_until, resolve_next_run};
use crate::scheduler::{SchedulingEngine, Trigger};
use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, info, instrument};

/// Timing knobs for update and monitor jobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Wall-clock budget of one update pass
    pub update_timeout: Duration,
    pub supervisor_poll_interval: Duration,
    /// Delay before the single retry of a failed pass
    pub retry_backoff: Duration,
    pub monitor_interval: Duration,
    pub daily_interval: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            update_timeout: Duration::from_secs(30 * 60),
            supervisor_poll_interval: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(30 * 60),
            monitor_interval: Duration::from_secs(5 * 60),
            daily_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl SchedulerOptions {
    /// Age after which a held lock is considered abandoned
    pub fn monitor_max_lock_age(&self) -> Duration {
        self.update_timeout / 2
    }
}

/// Result of [`CacheScheduler::force_update`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "job", rename_all = "snake_case")]
pub enum ForceUpdate {
    Scheduled(JobName),
    /// The lock is held; nothing was queued
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy)]
struct StartConfig {
    update_on_startup: bool,
    daily_update_time: NaiveTime,
}

/// Top-level orchestration of cache refreshes for one backing store.
///
/// Owns the scheduling engine and the lock of that store. Jobs reach back to
/// the scheduler through a shared [`SchedulerContext`]; [`shutdown`] (or
/// dropping the scheduler) stops the engine and releases those jobs.
///
/// [`shutdown`]: CacheScheduler::shutdown
pub struct CacheScheduler {
    ctx: Arc<SchedulerContext>,
    start_config: OnceLock<StartConfig>,
}

impl CacheScheduler {
    pub fn new(
        store: Arc<dyn DataStore>,
        candidates: Vec<Arc<dyn CacheCandidate>>,
        lock_dir: impl AsRef<Path>,
        options: SchedulerOptions,
    ) -> Self {
        let lock = LockFileManager::new(lock_dir, &store.identity());
        info!(
            lock_path = %lock.path().display(),
            candidates = candidates.len(),
            "Cache scheduler created"
        );
        let ctx = SchedulerContext::new(SchedulingEngine::new(), lock, store, candidates, options);
        Self {
            ctx: Arc::new(ctx),
            start_config: OnceLock::new(),
        }
    }

    /// Arm the startup, daily and monitor triggers.
    ///
    /// The daily time is interpreted in the host's local time zone. Must be
    /// called once, from within a tokio runtime.
    pub fn start(
        &self,
        update_on_startup: bool,
        daily_update_time: NaiveTime,
    ) -> Result<(), SchedulingError> {
        self.start_at(update_on_startup, daily_update_time, &Local::now())
    }

    /// [`start`](Self::start) with an explicit reference instant for the
    /// first daily firing
    #[instrument(skip(self, now))]
    pub fn start_at<Tz: TimeZone>(
        &self,
        update_on_startup: bool,
        daily_update_time: NaiveTime,
        now: &DateTime<Tz>,
    ) -> Result<(), SchedulingError> {
        self.start_config
            .set(StartConfig {
                update_on_startup,
                daily_update_time,
            })
            .map_err(|_| SchedulingError::AlreadyStarted)?;

        let engine = &self.ctx.engine;
        let options = &self.ctx.options;
        let max_lock_age = LockAgePolicy::MaxAge(options.monitor_max_lock_age());

        if update_on_startup {
            let startup = UpdateJob::new(Arc::clone(&self.ctx), true)
                .with_stale_lock_sweep(LockAgePolicy::ReleaseIfUpdateLaunched);
            engine.schedule(Arc::new(startup), Trigger::now())?;
        }

        let next = resolve_next_run(daily_update_time, now)?;
        let delay = delay_until(&next, now);
        let daily =
            UpdateJob::new(Arc::clone(&self.ctx), true).with_stale_lock_sweep(max_lock_age);
        engine.schedule(
            Arc::new(daily),
            Trigger::repeating(delay, options.daily_interval),
        )?;

        let monitor = MonitorJob::new(Arc::clone(&self.ctx), max_lock_age);
        engine.schedule(
            Arc::new(monitor),
            Trigger::repeating(options.monitor_interval, options.monitor_interval),
        )?;

        info!(
            next_daily_update = %next.with_timezone(&Utc),
            initial_delay_secs = delay.as_secs(),
            monitor_interval_secs = options.monitor_interval.as_secs(),
            "Cache scheduler started"
        );
        Ok(())
    }

    /// Queue an immediate one-shot update unless one is already running
    #[instrument(skip(self))]
    pub fn force_update(&self) -> Result<ForceUpdate, SchedulingError> {
        if self.ctx.lock.is_held() {
            info!(
                lock_path = %self.ctx.lock.path().display(),
                "Cache update already running, force update ignored"
            );
            return Ok(ForceUpdate::AlreadyRunning);
        }

        let job = UpdateJob::new(Arc::clone(&self.ctx), true).with_stale_lock_sweep(
            LockAgePolicy::MaxAge(self.ctx.options.monitor_max_lock_age()),
        );
        let name = job.name().clone();
        self.ctx.engine.schedule(Arc::new(job), Trigger::now())?;

        info!(job = %name, "Forced cache update scheduled");
        Ok(ForceUpdate::Scheduled(name))
    }

    /// Stop the engine, release the lock and cancel every in-flight update.
    ///
    /// Does not wait for the cancelled refresh workers; the returned runs
    /// report when each worker has really stopped.
    #[instrument(skip(self))]
    pub fn shutdown(&self) -> Vec<Arc<UpdateRun>> {
        self.ctx.engine.shutdown();

        if let Err(e) = self.ctx.lock.release() {
            error!(error = %e, "Failed to release cache update lock on shutdown");
        }

        let runs = self.ctx.in_flight.drain();
        for run in &runs {
            run.cancel();
        }

        info!(cancelled_updates = runs.len(), "Cache scheduler shut down");
        runs
    }

    /// Candidates in refresh order
    pub fn candidates(&self) -> &[Arc<dyn CacheCandidate>] {
        &self.ctx.candidates
    }

    pub fn in_flight(&self) -> Vec<InFlightUpdate> {
        self.ctx.in_flight.snapshot()
    }

    pub fn status(&self) -> CacheStatus {
        let config = self.start_config.get();
        CacheStatus {
            update_on_startup: config.is_some_and(|c| c.update_on_startup),
            daily_update_time: config.map(|c| c.daily_update_time),
            lock_held: self.ctx.lock.is_held(),
            in_flight_updates: self.ctx.in_flight.len(),
            candidates: self
                .ctx
                .candidates
                .iter()
                .map(|candidate| CandidateStatus::of(candidate.as_ref()))
                .collect(),
        }
    }

    pub fn lock(&self) -> &LockFileManager {
        &self.ctx.lock
    }

    pub fn engine(&self) -> &SchedulingEngine {
        &self.ctx.engine
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.ctx.options
    }
}

impl Drop for CacheScheduler {
    fn drop(&mut self) {
        // Registered jobs hold the context, which holds the engine
        self.ctx.engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CacheUpdateError;
    use crate::jobs::JobKind;
    use chrono::{FixedOffset, NaiveDate};
    use tempfile::TempDir;

    struct TestStore;

    impl DataStore for TestStore {
        fn identity(&self) -> String {
            "scheduler-test-store".to_string()
        }
    }

    struct IdleCandidate;

    impl CacheCandidate for IdleCandidate {
        fn name(&self) -> &'static str {
            "idle"
        }

        fn update_from_store(&self, _store: &dyn DataStore) -> Result<(), CacheUpdateError> {
            Ok(())
        }

        fn cancel_in_flight_update(&self) {}

        fn last_updated_at(&self) -> Option<DateTime<Utc>> {
            None
        }
    }

    fn scheduler(dir: &TempDir) -> CacheScheduler {
        CacheScheduler::new(
            Arc::new(TestStore),
            vec![Arc::new(IdleCandidate)],
            dir.path(),
            SchedulerOptions::default(),
        )
    }

    fn four_am() -> NaiveTime {
        NaiveTime::from_hms_opt(4, 0, 0).unwrap()
    }

    #[test]
    fn test_default_options() {
        let options = SchedulerOptions::default();
        assert_eq!(options.update_timeout, Duration::from_secs(1800));
        assert_eq!(options.supervisor_poll_interval, Duration::from_secs(60));
        assert_eq!(options.retry_backoff, Duration::from_secs(1800));
        assert_eq!(options.monitor_max_lock_age(), Duration::from_secs(900));
    }

    #[tokio::test]
    async fn test_start_registers_daily_and_monitor_jobs() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        let now = FixedOffset::east_opt(0)
            .unwrap()
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(2024, 3, 10)
                    .unwrap()
                    .and_hms_opt(1, 30, 59)
                    .unwrap(),
            )
            .unwrap();

        scheduler.start_at(false, four_am(), &now).unwrap();

        let jobs = scheduler.engine().registered_jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.recurring));
        assert!(jobs.iter().any(|job| job.kind == JobKind::Monitor));
        assert!(jobs.iter().any(|job| job.kind
            == JobKind::Update {
                rescheduling_allowed: true
            }));
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);

        scheduler.start(false, four_am()).unwrap();
        let err = scheduler.start(false, four_am()).unwrap_err();

        assert_eq!(err, SchedulingError::AlreadyStarted);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_force_update_ignored_while_locked() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        assert!(scheduler.lock().try_acquire().unwrap());

        assert_eq!(scheduler.force_update().unwrap(), ForceUpdate::AlreadyRunning);
        assert!(scheduler.engine().registered_jobs().is_empty());
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_force_update_after_shutdown_fails() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        scheduler.shutdown();

        assert_eq!(scheduler.force_update(), Err(SchedulingError::ShutDown));
    }

    #[tokio::test]
    async fn test_shutdown_releases_lock() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        scheduler.start(false, four_am()).unwrap();
        assert!(scheduler.lock().try_acquire().unwrap());

        scheduler.shutdown();

        assert!(!scheduler.lock().is_held());
        assert!(scheduler.engine().is_shut_down());
        assert!(scheduler.engine().registered_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_status_reports_configuration_and_candidates() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        assert!(!scheduler.status().update_on_startup);

        scheduler.start(false, four_am()).unwrap();
        let status = scheduler.status();

        assert_eq!(status.daily_update_time, Some(four_am()));
        assert!(!status.lock_held);
        assert_eq!(status.in_flight_updates, 0);
        assert_eq!(status.candidates.len(), 1);
        assert_eq!(status.candidates[0].name, "idle");
        assert_eq!(scheduler.candidates().len(), 1);
        scheduler.shutdown();
    }
}
