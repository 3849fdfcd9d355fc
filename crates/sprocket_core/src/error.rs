//! Core error types for SPROCKET.

use std::fmt;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid encoding
    InvalidEncoding,

    /// Invalid resource id
    InvalidId {
        /// Why the id was refused
        reason: String,
    },

    /// Invalid document body
    InvalidDocument {
        /// Why the body was refused
        reason: String,
    },

    /// Invalid continuation token
    InvalidContinuation {
        /// Why the token was refused
        reason: String,
    },

    /// Validation error
    Validation {
        /// Offending field
        field: String,
        /// Reason
        reason: String,
    },

    /// Not found
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource id
        id: String,
    },

    /// Already exists
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Resource id
        id: String,
    },

    /// Conditional request failed (etag mismatch)
    PreconditionFailed {
        /// Resource id
        id: String,
    },

    /// Capacity exceeded
    CapacityExceeded {
        /// Resource name
        resource: String,
        /// Limit that was hit
        limit: u64,
    },

    /// Timeout
    Timeout {
        /// Operation that timed out
        operation: String,
    },

    /// Internal error (for unexpected errors)
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Shorthand for a missing document
    #[must_use]
    pub fn document_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "Document".to_string(),
            id: id.to_string(),
        }
    }

    /// Shorthand for a duplicate document
    #[must_use]
    pub fn document_exists(id: &str) -> Self {
        Self::AlreadyExists {
            kind: "Document".to_string(),
            id: id.to_string(),
        }
    }

    /// HTTP-style status code matching the error, as reported to script callbacks
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::AlreadyExists { .. } => 409,
            Self::PreconditionFailed { .. } => 412,
            Self::CapacityExceeded { .. } => 413,
            Self::Timeout { .. } => 408,
            Self::Internal { .. } => 500,
            Self::InvalidEncoding
            | Self::InvalidId { .. }
            | Self::InvalidDocument { .. }
            | Self::InvalidContinuation { .. }
            | Self::Validation { .. } => 400,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding => write!(f, "Invalid encoding"),
            Self::InvalidId { reason } => write!(f, "Invalid ID: {}", reason),
            Self::InvalidDocument { reason } => write!(f, "Invalid document: {}", reason),
            Self::InvalidContinuation { reason } => {
                write!(f, "Invalid continuation token: {}", reason)
            }
            Self::Validation { field, reason } => {
                write!(f, "Validation failed for {}: {}", field, reason)
            }
            Self::NotFound { kind, id } => write!(f, "{} not found: {}", kind, id),
            Self::AlreadyExists { kind, id } => write!(f, "{} already exists: {}", kind, id),
            Self::PreconditionFailed { id } => {
                write!(f, "Precondition failed for {}: etag mismatch", id)
            }
            Self::CapacityExceeded { resource, limit } => {
                write!(f, "Capacity exceeded for {}: {}", resource, limit)
            }
            Self::Timeout { operation } => write!(f, "Timeout: {}", operation),
            Self::Internal { message } => write!(f, "Internal error: {}", message),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<serde_json::Error> for CoreError {
    fn from(_err: serde_json::Error) -> Self {
        Self::InvalidEncoding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::InvalidEncoding;
        assert_eq!(format!("{}", err), "Invalid encoding");

        let err = CoreError::document_not_found("doc-1");
        assert_eq!(format!("{}", err), "Document not found: doc-1");
    }

    #[test]
    fn test_precondition_display() {
        let err = CoreError::PreconditionFailed {
            id: "abc".to_string(),
        };
        let s = err.to_string();
        assert!(s.contains("abc"));
        assert!(s.contains("etag"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(CoreError::document_not_found("x").status_code(), 404);
        assert_eq!(CoreError::document_exists("x").status_code(), 409);
        assert_eq!(
            CoreError::PreconditionFailed { id: "x".into() }.status_code(),
            412
        );
        assert_eq!(CoreError::InvalidEncoding.status_code(), 400);
    }

    #[test]
    fn test_error_equality() {
        let err1 = CoreError::InvalidEncoding;
        let err2 = CoreError::InvalidEncoding;
        assert_eq!(err1, err2);
        assert_ne!(err1, CoreError::document_exists("a"));
    }
}
