//! Transaction boundary around one invocation.
//!
//! ```text
//! Running ──commit──▶ Committed
//!    │
//!    └──abort───▶ Aborted(reason)
//! ```
//!
//! Both terminal states are final. Aborting discards the staged overlay, so
//! nothing the invocation did is visible afterwards.

use serde::{Deserialize, Serialize};
use sprocket_core::InvocationId;
use sprocket_storage::{StagedView, StoreError};
use std::fmt;
use std::time::Duration;

/// Why an invocation was rolled back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum AbortReason {
    /// The budget ran out before the invocation finished
    DeadlineExceeded,
    /// A completion callback raised an error
    CallbackFailed {
        /// Error text
        message: String,
    },
    /// The script's entry point raised an error
    ScriptFailed {
        /// Error text
        message: String,
    },
    /// A touched resource changed before commit
    Conflict {
        /// Conflicting resource
        key: String,
    },
    /// The store failed while committing
    CommitFailed {
        /// Error text
        message: String,
    },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::CallbackFailed { message } => write!(f, "callback failed: {message}"),
            Self::ScriptFailed { message } => write!(f, "script failed: {message}"),
            Self::Conflict { key } => write!(f, "conflict on {key}"),
            Self::CommitFailed { message } => write!(f, "commit failed: {message}"),
        }
    }
}

/// Transaction state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TransactionState {
    /// Script still running
    Running,
    /// Every staged write applied
    Committed,
    /// Every staged write discarded
    Aborted {
        /// Why
        #[serde(flatten)]
        reason: AbortReason,
    },
}

impl TransactionState {
    /// Whether the state is final
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether the invocation committed
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }

    /// Abort reason, if aborted
    #[must_use]
    pub const fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            Self::Aborted { reason } => Some(reason),
            _ => None,
        }
    }
}

/// All-or-nothing scope of one invocation
#[derive(Debug)]
pub struct TransactionBoundary {
    invocation: InvocationId,
    state: TransactionState,
    view: StagedView,
}

impl TransactionBoundary {
    /// Open a running transaction over a staged view
    #[must_use]
    pub fn begin(invocation: InvocationId, view: StagedView) -> Self {
        Self {
            invocation,
            state: TransactionState::Running,
            view,
        }
    }

    /// Staged view operations run against
    #[must_use]
    pub fn view(&self) -> &StagedView {
        &self.view
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    /// Apply the staged writes.
    ///
    /// A conflict aborts the transaction and is reported through the
    /// returned state. Calling this on a finished transaction returns its
    /// state unchanged.
    ///
    /// # Errors
    ///
    /// Returns the store error when the backend itself fails; the
    /// transaction is then aborted with [`AbortReason::CommitFailed`].
    pub async fn commit(&mut self) -> Result<u64, StoreError> {
        if self.state.is_terminal() {
            return Ok(0);
        }
        match self.view.commit().await {
            Ok(receipt) => {
                self.state = TransactionState::Committed;
                tracing::debug!(invocation = %self.invocation, writes = receipt.writes, "committed");
                Ok(receipt.writes as u64)
            }
            Err(StoreError::Conflict { key }) => {
                tracing::info!(invocation = %self.invocation, %key, "commit conflict");
                self.state = TransactionState::Aborted {
                    reason: AbortReason::Conflict { key },
                };
                Ok(0)
            }
            Err(err) => {
                self.state = TransactionState::Aborted {
                    reason: AbortReason::CommitFailed {
                        message: err.to_string(),
                    },
                };
                Err(err)
            }
        }
    }

    /// Apply the staged writes, giving up after `limit`.
    ///
    /// Returns `Ok(None)` when the store did not answer in time; the
    /// transaction is then aborted with [`AbortReason::DeadlineExceeded`].
    /// The store may still apply the batch after that point (a blocking
    /// backend keeps writing once its future is dropped), so the caller
    /// must treat the writes as in doubt rather than rolled back.
    ///
    /// # Errors
    ///
    /// Same as [`TransactionBoundary::commit`].
    pub async fn commit_within(&mut self, limit: Duration) -> Result<Option<u64>, StoreError> {
        match tokio::time::timeout(limit, self.commit()).await {
            Ok(result) => result.map(Some),
            Err(_) => {
                tracing::warn!(invocation = %self.invocation, ?limit, "commit timed out, writes in doubt");
                self.state = TransactionState::Aborted {
                    reason: AbortReason::DeadlineExceeded,
                };
                Ok(None)
            }
        }
    }

    /// Discard the staged writes. No effect once terminal.
    pub async fn abort(&mut self, reason: AbortReason) {
        if self.state.is_terminal() {
            return;
        }
        let discarded = self.view.discard().await;
        tracing::info!(invocation = %self.invocation, %reason, discarded, "aborted");
        self.state = TransactionState::Aborted { reason };
    }
}
