//! Admission control for script operations.
//!
//! The gate decides synchronously whether an operation may still be queued.
//! An operation is accepted only while the remaining budget covers the
//! safety margin plus the projected latency of everything already pending
//! and the new operation itself. Once the gate rejects, it stays closed for
//! the rest of the invocation.

use crate::deadline::DeadlineMonitor;
use crate::queue::{CallbackTag, OperationQueue, OperationRequest};
use serde::{Deserialize, Serialize};
use sprocket_core::{CollectionLink, OperationId};
use std::fmt;
use std::time::Duration;

/// Weight of a new latency sample in the moving average
const LATENCY_WEIGHT: f64 = 0.25;

/// Admission configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Budget kept in reserve for commit, in milliseconds
    pub safety_margin_ms: u64,
    /// Initial per-operation latency estimate, in milliseconds
    pub latency_estimate_ms: u64,
    /// Lowest value the latency estimate may fall to, in milliseconds
    pub latency_floor_ms: u64,
    /// Maximum operations queued or running at once (0 = unlimited)
    pub max_pending: usize,
}

impl AdmissionConfig {
    /// Set safety margin
    #[must_use]
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin_ms = duration_ms(margin);
        self
    }

    /// Set initial latency estimate
    #[must_use]
    pub fn with_latency_estimate(mut self, estimate: Duration) -> Self {
        self.latency_estimate_ms = duration_ms(estimate);
        self
    }

    /// Set latency floor
    #[must_use]
    pub fn with_latency_floor(mut self, floor: Duration) -> Self {
        self.latency_floor_ms = duration_ms(floor);
        self
    }

    /// Set pending limit
    #[must_use]
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Safety margin
    #[must_use]
    pub const fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }

    /// Initial latency estimate
    #[must_use]
    pub const fn latency_estimate(&self) -> Duration {
        Duration::from_millis(self.latency_estimate_ms)
    }

    /// Latency floor
    #[must_use]
    pub const fn latency_floor(&self) -> Duration {
        Duration::from_millis(self.latency_floor_ms)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            safety_margin_ms: 1_000,
            latency_estimate_ms: 50,
            latency_floor_ms: 10,
            max_pending: 64,
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Why an operation was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    /// Not enough budget left to finish safely
    DeadlineMargin {
        /// Budget left at the decision
        remaining: Duration,
        /// Budget the gate asked for
        required: Duration,
    },
    /// Too many operations pending
    QueueFull {
        /// Configured limit
        limit: usize,
    },
    /// An earlier operation was already rejected
    Latched,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlineMargin {
                remaining,
                required,
            } => write!(f, "{remaining:?} left, {required:?} required"),
            Self::QueueFull { limit } => write!(f, "{limit} operations already pending"),
            Self::Latched => write!(f, "gate closed by an earlier rejection"),
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Queued under this id
    Accepted(OperationId),
    /// Not queued
    Rejected(RejectReason),
}

impl AdmissionDecision {
    /// Whether the operation was queued
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Id of the queued operation
    #[must_use]
    pub const fn operation(&self) -> Option<OperationId> {
        match self {
            Self::Accepted(id) => Some(*id),
            Self::Rejected(_) => None,
        }
    }

    /// Rejection reason
    #[must_use]
    pub const fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected(reason) => Some(reason),
        }
    }
}

/// Admission gate
///
/// One per invocation. Decisions are final: an accepted operation is queued
/// immediately and a rejection latches the gate.
#[derive(Debug)]
pub struct AdmissionGate {
    config: AdmissionConfig,
    estimate: Duration,
    latched: bool,
    accepted: u64,
    rejected: u64,
}

impl AdmissionGate {
    /// Create an open gate
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        let estimate = config.latency_estimate().max(config.latency_floor());
        Self {
            config,
            estimate,
            latched: false,
            accepted: 0,
            rejected: 0,
        }
    }

    /// Budget needed to admit one more operation with `pending` ahead of it
    #[must_use]
    pub fn required_budget(&self, pending: usize) -> Duration {
        let slots = u32::try_from(pending.saturating_add(1)).unwrap_or(u32::MAX);
        self.config
            .safety_margin()
            .saturating_add(self.estimate.saturating_mul(slots))
    }

    /// Evaluate without side effects
    ///
    /// # Errors
    ///
    /// Returns the reason the operation would be rejected
    pub fn evaluate(&self, monitor: &DeadlineMonitor, pending: usize) -> Result<(), RejectReason> {
        if self.latched {
            return Err(RejectReason::Latched);
        }
        if self.config.max_pending > 0 && pending >= self.config.max_pending {
            return Err(RejectReason::QueueFull {
                limit: self.config.max_pending,
            });
        }
        let remaining = monitor.remaining();
        let required = self.required_budget(pending);
        if remaining < required {
            return Err(RejectReason::DeadlineMargin {
                remaining,
                required,
            });
        }
        Ok(())
    }

    /// Decide on an operation, queueing it if accepted
    pub fn admit(
        &mut self,
        monitor: &DeadlineMonitor,
        queue: &mut OperationQueue,
        collection: CollectionLink,
        request: OperationRequest,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        match self.evaluate(monitor, queue.pending()) {
            Ok(()) => {
                self.accepted += 1;
                AdmissionDecision::Accepted(queue.enqueue(collection, request, tag))
            }
            Err(reason) => {
                self.latched = true;
                self.rejected += 1;
                AdmissionDecision::Rejected(reason)
            }
        }
    }

    /// Fold an observed operation latency into the estimate
    pub fn observe_latency(&mut self, sample: Duration) {
        let blended = self.estimate.mul_f64(1.0 - LATENCY_WEIGHT) + sample.mul_f64(LATENCY_WEIGHT);
        self.estimate = blended.max(self.config.latency_floor());
    }

    /// Close the gate without a rejection
    pub fn latch(&mut self) {
        self.latched = true;
    }

    /// Current latency estimate
    #[must_use]
    pub const fn estimate(&self) -> Duration {
        self.estimate
    }

    /// Whether the gate is closed
    #[must_use]
    pub const fn is_latched(&self) -> bool {
        self.latched
    }

    /// Operations accepted
    #[must_use]
    pub const fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Operations rejected
    #[must_use]
    pub const fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Configuration
    #[must_use]
    pub const fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::DEFAULT_BUDGET;
    use proptest::prelude::*;
    use serde_json::json;
    use sprocket_core::{CreateOptions, Document, ManualClock};

    fn coll() -> CollectionLink {
        CollectionLink::parse("orders").unwrap()
    }

    fn create() -> OperationRequest {
        OperationRequest::CreateDocument {
            document: Document::from_value(json!({})).unwrap(),
            options: CreateOptions::default(),
        }
    }

    #[test]
    fn test_admission_config_default() {
        let config = AdmissionConfig::default();
        assert_eq!(config.safety_margin(), Duration::from_secs(1));
        assert_eq!(config.latency_estimate(), Duration::from_millis(50));
        assert_eq!(config.max_pending, 64);
    }

    #[test]
    fn test_accepts_with_budget_and_enqueues() {
        let clock = ManualClock::shared();
        let monitor = DeadlineMonitor::new(clock, DEFAULT_BUDGET);
        let mut queue = OperationQueue::new();
        let mut gate = AdmissionGate::default();

        let decision = gate.admit(&monitor, &mut queue, coll(), create(), 7);
        assert!(decision.is_accepted());
        assert_eq!(queue.pending(), 1);
        assert_eq!(gate.accepted(), 1);
        assert_eq!(queue.start_next(1).map(|op| op.tag), Some(7));
    }

    #[test]
    fn test_rejects_inside_safety_margin() {
        let clock = ManualClock::shared();
        let monitor = DeadlineMonitor::new(clock.clone(), DEFAULT_BUDGET);
        let mut queue = OperationQueue::new();
        let mut gate = AdmissionGate::default();

        // 1.1s left, 1s margin + 50ms estimate required
        clock.advance(Duration::from_millis(3_900));
        assert!(gate.evaluate(&monitor, 0).is_ok());

        // 1.04s left
        clock.advance(Duration::from_millis(60));
        let decision = gate.admit(&monitor, &mut queue, coll(), create(), 0);
        assert_eq!(
            decision,
            AdmissionDecision::Rejected(RejectReason::DeadlineMargin {
                remaining: Duration::from_millis(1_040),
                required: Duration::from_millis(1_050),
            })
        );
        assert!(queue.is_idle());
    }

    #[test]
    fn test_pending_operations_raise_requirement() {
        let gate = AdmissionGate::default();
        assert_eq!(gate.required_budget(0), Duration::from_millis(1_050));
        assert_eq!(gate.required_budget(3), Duration::from_millis(1_200));
    }

    #[test]
    fn test_rejection_latches() {
        let clock = ManualClock::shared();
        let monitor = DeadlineMonitor::new(clock.clone(), DEFAULT_BUDGET);
        let mut queue = OperationQueue::new();
        let mut gate = AdmissionGate::default();

        clock.advance(Duration::from_millis(4_500));
        assert!(!gate.admit(&monitor, &mut queue, coll(), create(), 0).is_accepted());

        // plenty of budget again would not reopen it
        let fresh = DeadlineMonitor::new(clock, DEFAULT_BUDGET);
        let decision = gate.admit(&fresh, &mut queue, coll(), create(), 0);
        assert_eq!(decision.reject_reason(), Some(&RejectReason::Latched));
        assert_eq!(gate.rejected(), 2);
        assert!(gate.is_latched());
    }

    #[test]
    fn test_queue_full() {
        let monitor = DeadlineMonitor::new(ManualClock::shared(), DEFAULT_BUDGET);
        let mut queue = OperationQueue::new();
        let mut gate = AdmissionGate::new(AdmissionConfig::default().with_max_pending(2));

        assert!(gate.admit(&monitor, &mut queue, coll(), create(), 0).is_accepted());
        assert!(gate.admit(&monitor, &mut queue, coll(), create(), 1).is_accepted());
        let third = gate.admit(&monitor, &mut queue, coll(), create(), 2);
        assert_eq!(
            third.reject_reason(),
            Some(&RejectReason::QueueFull { limit: 2 })
        );
        assert_eq!(queue.pending(), 2);
    }

    #[test]
    fn test_latency_estimate_tracks_samples_above_floor() {
        let mut gate = AdmissionGate::new(
            AdmissionConfig::default()
                .with_latency_estimate(Duration::from_millis(100))
                .with_latency_floor(Duration::from_millis(40)),
        );

        gate.observe_latency(Duration::from_millis(500));
        let drift = gate.estimate().abs_diff(Duration::from_millis(200));
        assert!(drift < Duration::from_micros(1), "estimate {:?}", gate.estimate());

        for _ in 0..64 {
            gate.observe_latency(Duration::ZERO);
        }
        assert_eq!(gate.estimate(), Duration::from_millis(40));
    }

    #[test]
    fn test_estimate_starts_at_floor_when_configured_lower() {
        let gate = AdmissionGate::new(
            AdmissionConfig::default()
                .with_latency_estimate(Duration::from_millis(1))
                .with_latency_floor(Duration::from_millis(20)),
        );
        assert_eq!(gate.estimate(), Duration::from_millis(20));
    }

    proptest! {
        #[test]
        fn prop_accept_implies_budget_covers_margin(
            elapsed_ms in 0u64..6_000,
            pending in 0usize..10,
            margin_ms in 0u64..2_000,
            estimate_ms in 1u64..500,
        ) {
            let clock = ManualClock::shared();
            let monitor = DeadlineMonitor::new(clock.clone(), DEFAULT_BUDGET);
            let config = AdmissionConfig::default()
                .with_safety_margin(Duration::from_millis(margin_ms))
                .with_latency_estimate(Duration::from_millis(estimate_ms))
                .with_latency_floor(Duration::from_millis(1))
                .with_max_pending(0);
            let mut gate = AdmissionGate::new(config);

            let mut queue = OperationQueue::new();
            for _ in 0..pending {
                queue.enqueue(coll(), create(), 0);
            }
            clock.advance(Duration::from_millis(elapsed_ms));

            let decision = gate.admit(&monitor, &mut queue, coll(), create(), 0);
            if decision.is_accepted() {
                let floor = Duration::from_millis(margin_ms + estimate_ms * (pending as u64 + 1));
                prop_assert!(monitor.remaining() >= floor);
                prop_assert!(!monitor.is_expired());
            } else {
                prop_assert!(gate.is_latched());
            }
        }
    }
}
