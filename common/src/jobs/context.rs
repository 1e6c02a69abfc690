// Shared state handed to every job created by a cache scheduler

use crate::cache::{CacheCandidate, DataStore};
use crate::cache_scheduler::SchedulerOptions;
use crate::jobs::InFlightJobs;
use crate::lock::LockFileManager;
use crate::scheduler::SchedulingEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Explicit handle replacing process-global scheduler state.
///
/// Jobs hold an `Arc<SchedulerContext>` so they can reach the engine (for
/// retries), the lock, the candidates and the in-flight set of the scheduler
/// that created them.
pub struct SchedulerContext {
    pub engine: SchedulingEngine,
    pub lock: LockFileManager,
    pub store: Arc<dyn DataStore>,
    pub candidates: Arc<[Arc<dyn CacheCandidate>]>,
    pub in_flight: InFlightJobs,
    pub options: SchedulerOptions,
    update_launched: AtomicBool,
}

impl SchedulerContext {
    pub fn new(
        engine: SchedulingEngine,
        lock: LockFileManager,
        store: Arc<dyn DataStore>,
        candidates: Vec<Arc<dyn CacheCandidate>>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            engine,
            lock,
            store,
            candidates: candidates.into(),
            in_flight: InFlightJobs::new(),
            options,
            update_launched: AtomicBool::new(false),
        }
    }

    /// Record that this scheduler has launched at least one update
    pub fn mark_update_launched(&self) {
        self.update_launched.store(true, Ordering::SeqCst);
    }

    pub fn has_launched_update(&self) -> bool {
        self.update_launched.load(Ordering::SeqCst)
    }
}
