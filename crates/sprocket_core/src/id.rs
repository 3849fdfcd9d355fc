//! Identifiers for SPROCKET entities.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Invocation identifier - identifies one run of a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvocationId(Uuid);

impl InvocationId {
    /// Create a new random InvocationId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inv_{}", self.0)
    }
}

/// Operation identifier.
///
/// Sequence numbers are assigned by the invocation that accepted the
/// operation, starting at zero, so they double as submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(u64);

impl OperationId {
    /// First id handed out by an invocation
    #[must_use]
    pub const fn first() -> Self {
        Self(0)
    }

    /// Create from raw sequence number
    #[must_use]
    pub const fn from_raw(seq: u64) -> Self {
        Self(seq)
    }

    /// Raw sequence number
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The id following this one
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op_{}", self.0)
    }
}
