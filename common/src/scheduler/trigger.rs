// Trigger: start delay plus optional repeat interval

use std::time::Duration;

/// When a job fires.
///
/// A zero `start_delay` fires immediately; a zero `repeat_interval` fires once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub start_delay: Duration,
    pub repeat_interval: Duration,
}

impl Trigger {
    /// Fire once, immediately
    pub fn now() -> Self {
        Self::after(Duration::ZERO)
    }

    /// Fire once after `delay`
    pub fn after(delay: Duration) -> Self {
        Self {
            start_delay: delay,
            repeat_interval: Duration::ZERO,
        }
    }

    /// Fire after `delay`, then every `interval`
    pub fn repeating(delay: Duration, interval: Duration) -> Self {
        Self {
            start_delay: delay,
            repeat_interval: interval,
        }
    }

    pub fn is_one_shot(&self) -> bool {
        self.repeat_interval.is_zero()
    }
}
