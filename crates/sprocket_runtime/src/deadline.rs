//! Wall-clock budget of one invocation.

use sprocket_core::SharedClock;
use std::time::Duration;

/// Default execution budget per invocation
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(5);

/// Deadline monitor
///
/// Captures the clock reading at creation and answers queries against a
/// fixed budget. Queries have no side effects.
#[derive(Debug, Clone)]
pub struct DeadlineMonitor {
    clock: SharedClock,
    started: Duration,
    budget: Duration,
}

impl DeadlineMonitor {
    /// Start a monitor now
    #[must_use]
    pub fn new(clock: SharedClock, budget: Duration) -> Self {
        let started = clock.now();
        Self {
            clock,
            started,
            budget,
        }
    }

    /// Time since start
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.started)
    }

    /// Time left before the deadline, zero once expired
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    /// Whether the budget is used up
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.budget
    }

    /// Clock reading at which the budget runs out
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.started.saturating_add(self.budget)
    }

    /// Configured budget
    #[must_use]
    pub const fn budget(&self) -> Duration {
        self.budget
    }

    /// Clock reading now
    #[must_use]
    pub fn now(&self) -> Duration {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprocket_core::{ManualClock, MonotonicClock};

    #[test]
    fn test_monitor_counts_down() {
        let clock = ManualClock::shared();
        clock.advance(Duration::from_secs(10));
        let monitor = DeadlineMonitor::new(clock.clone(), DEFAULT_BUDGET);

        assert_eq!(monitor.elapsed(), Duration::ZERO);
        assert_eq!(monitor.remaining(), DEFAULT_BUDGET);
        assert_eq!(monitor.deadline(), Duration::from_secs(15));

        clock.advance(Duration::from_millis(1500));
        assert_eq!(monitor.remaining(), Duration::from_millis(3500));
        assert!(!monitor.is_expired());
    }

    #[test]
    fn test_monitor_expires_and_saturates() {
        let clock = ManualClock::shared();
        let monitor = DeadlineMonitor::new(clock.clone(), Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));
        assert!(monitor.is_expired());
        assert_eq!(monitor.remaining(), Duration::ZERO);

        clock.advance(Duration::from_secs(5));
        assert_eq!(monitor.remaining(), Duration::ZERO);
        assert_eq!(monitor.elapsed(), Duration::from_secs(6));
    }

    #[test]
    fn test_monitor_zero_budget_is_expired() {
        let monitor = DeadlineMonitor::new(ManualClock::shared(), Duration::ZERO);
        assert!(monitor.is_expired());
    }

    #[test]
    fn test_monitor_on_monotonic_clock() {
        let monitor = DeadlineMonitor::new(MonotonicClock::shared(), DEFAULT_BUDGET);
        assert!(monitor.remaining() <= DEFAULT_BUDGET);
        assert!(!monitor.is_expired());
    }
}
