// Monitor job: detects and clears lock files abandoned by crashed or hung updates

use crate::errors::{JobError, LockError};
use crate::jobs::{Job, JobKind, JobName, SchedulerContext};
use crate::lock::LockFileManager;
use crate::telemetry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// When a held lock counts as stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAgePolicy {
    /// Release a lock older than this
    MaxAge(Duration),
    /// Release unconditionally once this process has launched an update.
    /// Used as the clean-slate check on startup, not for routine sweeps.
    ReleaseIfUpdateLaunched,
}

/// Result of one stale lock check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleLockCheck {
    NotHeld,
    /// Held and younger than the configured maximum age
    Fresh(Duration),
    /// Held, but no update has been launched by this process yet
    Kept,
    Released,
    /// Filesystem error, already logged
    Failed(String),
}

/// Check the lock once under `policy` and release it if stale.
///
/// Never fails: filesystem errors are logged and reported as
/// [`StaleLockCheck::Failed`].
pub fn sweep_stale_lock(
    lock: &LockFileManager,
    policy: LockAgePolicy,
    update_launched: bool,
) -> StaleLockCheck {
    match check_and_release(lock, policy, update_launched) {
        Ok(check) => check,
        // Released between the existence check and the age read
        Err(LockError::NotFound(_)) => StaleLockCheck::NotHeld,
        Err(e) => {
            error!(lock_path = %lock.path().display(), error = %e, "Stale lock check failed");
            StaleLockCheck::Failed(e.to_string())
        }
    }
}

fn check_and_release(
    lock: &LockFileManager,
    policy: LockAgePolicy,
    update_launched: bool,
) -> Result<StaleLockCheck, LockError> {
    if !lock.is_held() {
        debug!(lock_path = %lock.path().display(), "Lock not held");
        return Ok(StaleLockCheck::NotHeld);
    }

    match policy {
        LockAgePolicy::MaxAge(max_age) => {
            let age = lock.age_of()?;
            if age <= max_age {
                debug!(
                    lock_path = %lock.path().display(),
                    age_secs = age.as_secs(),
                    max_age_secs = max_age.as_secs(),
                    "Lock held by a running update"
                );
                return Ok(StaleLockCheck::Fresh(age));
            }
            lock.release()?;
            telemetry::record_stale_lock_released();
            warn!(
                lock_path = %lock.path().display(),
                age_secs = age.as_secs(),
                max_age_secs = max_age.as_secs(),
                "Released stale lock"
            );
            Ok(StaleLockCheck::Released)
        }
        LockAgePolicy::ReleaseIfUpdateLaunched => {
            if !update_launched {
                debug!(lock_path = %lock.path().display(), "No update launched yet, keeping lock");
                return Ok(StaleLockCheck::Kept);
            }
            lock.release()?;
            telemetry::record_stale_lock_released();
            info!(lock_path = %lock.path().display(), "Released leftover lock");
            Ok(StaleLockCheck::Released)
        }
    }
}

/// Recurring job sweeping the lock file of its scheduler
pub struct MonitorJob {
    name: JobName,
    ctx: Arc<SchedulerContext>,
    policy: LockAgePolicy,
}

impl MonitorJob {
    pub fn new(ctx: Arc<SchedulerContext>, policy: LockAgePolicy) -> Self {
        Self {
            name: JobName::unique("monitor"),
            ctx,
            policy,
        }
    }

    pub fn policy(&self) -> LockAgePolicy {
        self.policy
    }

    pub fn check(&self) -> StaleLockCheck {
        sweep_stale_lock(&self.ctx.lock, self.policy, self.ctx.has_launched_update())
    }
}

#[async_trait]
impl Job for MonitorJob {
    fn name(&self) -> &JobName {
        &self.name
    }

    fn kind(&self) -> JobKind {
        JobKind::Monitor
    }

    #[instrument(skip(self), fields(job = %self.name))]
    async fn run(&self) -> Result<(), JobError> {
        let check = self.check();
        debug!(result = ?check, "Stale lock check finished");
        Ok(())
    }

    fn cancel(&self) {}
}
