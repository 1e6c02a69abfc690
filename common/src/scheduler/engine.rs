// Scheduling engine implementation
//
// Each scheduled job gets its own timer task. A firing resolves the job
// through the registry and runs it on a separate runtime task, so a slow job
// never delays another trigger.

use crate::errors::SchedulingError;
use crate::jobs::{Job, JobName};
use crate::scheduler::registry::{JobRegistry, RegisteredJobInfo};
use crate::scheduler::Trigger;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

struct EngineInner {
    registry: JobRegistry,
    shutdown: CancellationToken,
    timers: Mutex<HashMap<JobName, JoinHandle<()>>>,
}

/// Timer/trigger service. Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct SchedulingEngine {
    inner: Arc<EngineInner>,
}

impl Default for SchedulingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry: JobRegistry::new(),
                shutdown: CancellationToken::new(),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register `job` and arm `trigger` for it.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self, job), fields(job = %job.name()))]
    pub fn schedule(&self, job: Arc<dyn Job>, trigger: Trigger) -> Result<(), SchedulingError> {
        if self.is_shut_down() {
            return Err(SchedulingError::ShutDown);
        }
        let runtime = Handle::try_current().map_err(|_| SchedulingError::NoRuntime)?;

        let name = job.name().clone();
        self.inner.registry.register(job, &trigger)?;

        let timer = runtime.spawn(run_trigger(Arc::clone(&self.inner), name.clone(), trigger));

        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.retain(|_, handle| !handle.is_finished());
        timers.insert(name, timer);

        debug!(
            start_delay_ms = trigger.start_delay.as_millis() as u64,
            repeat_interval_ms = trigger.repeat_interval.as_millis() as u64,
            "Job scheduled"
        );
        Ok(())
    }

    /// Stop all triggers and forget every registered job.
    ///
    /// Firings already dispatched keep running; waiting for them is up to the
    /// caller.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let dropped = self.inner.registry.clear();
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, timer) in timers.drain() {
            timer.abort();
        }

        info!(dropped_jobs = dropped, "Scheduling engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn is_registered(&self, name: &JobName) -> bool {
        self.inner.registry.contains(name)
    }

    pub fn lookup(&self, name: &JobName) -> Option<Arc<dyn Job>> {
        self.inner.registry.lookup(name)
    }

    pub fn registered_jobs(&self) -> Vec<RegisteredJobInfo> {
        self.inner.registry.snapshot()
    }
}

async fn run_trigger(inner: Arc<EngineInner>, name: JobName, trigger: Trigger) {
    tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        _ = sleep(trigger.start_delay) => {}
    }

    if !fire(&inner, &name) || trigger.is_one_shot() {
        return;
    }

    let Some(first_repeat) = Instant::now().checked_add(trigger.repeat_interval) else {
        warn!(job = %name, "Repeat interval out of range, trigger will not repeat");
        return;
    };
    let mut ticker = interval_at(first_repeat, trigger.repeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if !fire(&inner, &name) {
                    break;
                }
            }
        }
    }
}

/// Dispatch one firing. Returns false once the job is gone from the registry.
fn fire(inner: &EngineInner, name: &JobName) -> bool {
    if inner.shutdown.is_cancelled() {
        return false;
    }

    let Some(job) = inner.registry.take_for_firing(name) else {
        warn!(job = %name, "Trigger fired for unregistered job");
        return false;
    };

    debug!(job = %name, "Trigger fired");
    let name = name.clone();
    tokio::spawn(async move {
        if let Err(e) = job.run().await {
            error!(job = %name, error = %e, "Job firing failed");
        }
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::JobError;
    use crate::jobs::JobKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingJob {
        name: JobName,
        runs: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl CountingJob {
        fn new(name: &str, runs: &Arc<AtomicUsize>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                runs: Arc::clone(runs),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &JobName {
            &self.name
        }

        fn kind(&self) -> JobKind {
            JobKind::Monitor
        }

        async fn run(&self) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            Ok(())
        }

        fn cancel(&self) {}
    }

    struct FailingJob {
        name: JobName,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for FailingJob {
        fn name(&self) -> &JobName {
            &self.name
        }

        fn kind(&self) -> JobKind {
            JobKind::Monitor
        }

        async fn run(&self) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Err(JobError::Fatal("corrupt cache row".to_string()))
        }

        fn cancel(&self) {}
    }

    #[tokio::test]
    async fn test_one_shot_fires_once_and_is_deregistered() {
        let engine = SchedulingEngine::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let name = JobName::from("once");

        engine
            .schedule(CountingJob::new("once", &runs), Trigger::now())
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!engine.is_registered(&name));
        assert!(engine.lookup(&name).is_none());
    }

    #[tokio::test]
    async fn test_delayed_one_shot_waits_for_delay() {
        let engine = SchedulingEngine::new();
        let runs = Arc::new(AtomicUsize::new(0));

        engine
            .schedule(
                CountingJob::new("later", &runs),
                Trigger::after(Duration::from_millis(200)),
            )
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(engine.is_registered(&JobName::from("later")));

        sleep(Duration::from_millis(300)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recurring_fires_repeatedly_and_stays_registered() {
        let engine = SchedulingEngine::new();
        let runs = Arc::new(AtomicUsize::new(0));

        engine
            .schedule(
                CountingJob::new("tick", &runs),
                Trigger::repeating(Duration::ZERO, Duration::from_millis(30)),
            )
            .unwrap();
        sleep(Duration::from_millis(200)).await;

        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert!(engine.is_registered(&JobName::from("tick")));
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_failed_firing_keeps_recurring_trigger() {
        let engine = SchedulingEngine::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let name = JobName::from("failing");

        engine
            .schedule(
                Arc::new(FailingJob {
                    name: name.clone(),
                    runs: Arc::clone(&runs),
                }),
                Trigger::repeating(Duration::ZERO, Duration::from_millis(30)),
            )
            .unwrap();
        sleep(Duration::from_millis(200)).await;

        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert!(engine.is_registered(&name));
        assert_eq!(engine.registered_jobs().len(), 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_out_of_range_repeat_fires_once() {
        let engine = SchedulingEngine::new();
        let runs = Arc::new(AtomicUsize::new(0));

        engine
            .schedule(
                CountingJob::new("huge", &runs),
                Trigger::repeating(Duration::ZERO, Duration::from_secs(u64::MAX)),
            )
            .unwrap();
        sleep(Duration::from_millis(100)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_slow_job_does_not_block_other_triggers() {
        let engine = SchedulingEngine::new();
        let slow_runs = Arc::new(AtomicUsize::new(0));
        let fast_runs = Arc::new(AtomicUsize::new(0));

        engine
            .schedule(
                Arc::new(CountingJob {
                    name: "slow".into(),
                    runs: Arc::clone(&slow_runs),
                    delay: Duration::from_secs(5),
                }),
                Trigger::now(),
            )
            .unwrap();
        engine
            .schedule(
                CountingJob::new("fast", &fast_runs),
                Trigger::repeating(Duration::from_millis(10), Duration::from_millis(20)),
            )
            .unwrap();
        sleep(Duration::from_millis(150)).await;

        assert_eq!(slow_runs.load(Ordering::SeqCst), 1);
        assert!(fast_runs.load(Ordering::SeqCst) >= 2);
        engine.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs_and_stops_triggers() {
        let engine = SchedulingEngine::new();
        let runs = Arc::new(AtomicUsize::new(0));

        engine
            .schedule(
                CountingJob::new("pending", &runs),
                Trigger::after(Duration::from_millis(100)),
            )
            .unwrap();
        engine.shutdown();

        let err = engine
            .schedule(CountingJob::new("late", &runs), Trigger::now())
            .unwrap_err();
        assert_eq!(err, SchedulingError::ShutDown);

        sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(engine.registered_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_job_name_rejected() {
        let engine = SchedulingEngine::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let trigger = Trigger::after(Duration::from_secs(60));

        engine
            .schedule(CountingJob::new("same", &runs), trigger)
            .unwrap();
        let err = engine
            .schedule(CountingJob::new("same", &runs), trigger)
            .unwrap_err();

        assert_eq!(err, SchedulingError::DuplicateJob("same".to_string()));
        engine.shutdown();
    }

    #[test]
    fn test_schedule_outside_runtime_fails() {
        let engine = SchedulingEngine::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let err = engine
            .schedule(CountingJob::new("orphan", &runs), Trigger::now())
            .unwrap_err();
        assert_eq!(err, SchedulingError::NoRuntime);
        assert!(!engine.is_registered(&JobName::from("orphan")));
    }
}
