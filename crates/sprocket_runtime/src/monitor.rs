//! Invocation metrics and journal.
//!
//! Every admission decision, completion and terminal transition of an
//! invocation is appended to a bounded journal; the counters in
//! [`InvocationMetrics`] are derived from the same events.

use crate::admission::RejectReason;
use crate::queue::OperationKind;
use crate::transaction::AbortReason;
use serde::{Deserialize, Serialize};
use sprocket_core::OperationId;
use std::collections::VecDeque;
use std::time::Duration;

/// Invocation metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationMetrics {
    /// Operations admitted
    pub operations_accepted: u64,
    /// Operations refused by the gate
    pub operations_rejected: u64,
    /// Completions delivered
    pub operations_completed: u64,
    /// Completions carrying an error
    pub operations_failed: u64,
    /// Writes applied by the commit
    pub writes_committed: u64,
    /// Sum of operation latencies
    pub latency_total: Duration,
    /// Clock time from start to the terminal state
    pub elapsed: Duration,
}

impl InvocationMetrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean latency of delivered completions
    #[must_use]
    pub fn mean_latency(&self) -> Duration {
        match u32::try_from(self.operations_completed) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.latency_total / n,
            Err(_) => Duration::ZERO,
        }
    }

    /// Share of completions that succeeded (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.operations_completed == 0 {
            return 1.0;
        }
        (self.operations_completed - self.operations_failed) as f64
            / self.operations_completed as f64
    }
}

/// One journal entry; `at` is time since the invocation started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum JournalEvent {
    /// Operation queued
    Admitted {
        /// Assigned id
        operation: OperationId,
        /// Kind
        kind: OperationKind,
        /// Decision time
        at: Duration,
    },
    /// Operation refused
    Rejected {
        /// Kind of the refused operation
        kind: OperationKind,
        /// Why
        reason: RejectReason,
        /// Decision time
        at: Duration,
    },
    /// Completion delivered to the script
    Completed {
        /// Operation
        operation: OperationId,
        /// Kind
        kind: OperationKind,
        /// 200 on success, the error status otherwise
        status: u16,
        /// Start to completion
        latency: Duration,
    },
    /// Staged writes applied
    Committed {
        /// Number of writes
        writes: u64,
        /// Commit time
        at: Duration,
    },
    /// Staged writes discarded
    Aborted {
        /// Why
        reason: AbortReason,
        /// Abort time
        at: Duration,
    },
}

/// Metrics plus a bounded journal for one invocation
#[derive(Debug)]
pub struct InvocationRecorder {
    metrics: InvocationMetrics,
    journal: VecDeque<JournalEvent>,
    capacity: usize,
    dropped: u64,
}

impl InvocationRecorder {
    /// Create a recorder keeping at most `capacity` events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            metrics: InvocationMetrics::new(),
            journal: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Append an event and update the counters it implies
    pub fn record(&mut self, event: JournalEvent) {
        match &event {
            JournalEvent::Admitted { .. } => self.metrics.operations_accepted += 1,
            JournalEvent::Rejected { .. } => self.metrics.operations_rejected += 1,
            JournalEvent::Completed {
                status, latency, ..
            } => {
                self.metrics.operations_completed += 1;
                if *status >= 400 {
                    self.metrics.operations_failed += 1;
                }
                self.metrics.latency_total += *latency;
            }
            JournalEvent::Committed { writes, .. } => self.metrics.writes_committed = *writes,
            JournalEvent::Aborted { .. } => {}
        }

        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.journal.len() == self.capacity {
            self.journal.pop_front();
            self.dropped += 1;
        }
        self.journal.push_back(event);
    }

    /// Record the final elapsed time
    pub fn finish(&mut self, elapsed: Duration) {
        self.metrics.elapsed = elapsed;
    }

    /// Current metrics
    #[must_use]
    pub fn metrics(&self) -> &InvocationMetrics {
        &self.metrics
    }

    /// Retained events, oldest first
    pub fn journal(&self) -> impl Iterator<Item = &JournalEvent> {
        self.journal.iter()
    }

    /// Events evicted to respect the capacity
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Split into metrics and journal
    #[must_use]
    pub fn into_parts(self) -> (InvocationMetrics, Vec<JournalEvent>) {
        (self.metrics, self.journal.into())
    }
}

impl Default for InvocationRecorder {
    fn default() -> Self {
        Self::new(1024)
    }
}
