//! Per-request options recognised by collection operations.

use crate::document::{Etag, ResourceId};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Page size used when a feed request does not set one
pub const DEFAULT_PAGE_SIZE: usize = 100;
/// Largest page a feed request may ask for
pub const MAX_PAGE_SIZE: usize = 1000;

const CONTINUATION_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct FeedCursor {
    v: u8,
    after: String,
}

/// Opaque pagination cursor.
///
/// Callers treat it as an opaque string and hand it back unchanged to fetch
/// the next page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    /// Token resuming after the given id
    #[must_use]
    pub fn after(id: &ResourceId) -> Self {
        let cursor = FeedCursor {
            v: CONTINUATION_VERSION,
            after: id.as_str().to_string(),
        };
        let json = serde_json::to_vec(&cursor).unwrap_or_default();
        Self(hex::encode(json))
    }

    /// Wrap a token received from a caller
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Decode the resume position
    ///
    /// # Errors
    ///
    /// Returns error if the token was not produced by [`ContinuationToken::after`]
    pub fn resume_after(&self) -> CoreResult<ResourceId> {
        let bytes = hex::decode(&self.0).map_err(|e| CoreError::InvalidContinuation {
            reason: e.to_string(),
        })?;
        let cursor: FeedCursor =
            serde_json::from_slice(&bytes).map_err(|e| CoreError::InvalidContinuation {
                reason: e.to_string(),
            })?;
        if cursor.v != CONTINUATION_VERSION {
            return Err(CoreError::InvalidContinuation {
                reason: format!("unsupported token version {}", cursor.v),
            });
        }
        ResourceId::parse(cursor.after)
    }

    /// Borrow as str
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Options for feed reads and queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedOptions {
    /// Resume position from a previous page
    pub continuation: Option<ContinuationToken>,
    /// Maximum documents per page
    pub page_size: Option<usize>,
}

impl FeedOptions {
    /// Create empty options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set continuation token
    #[must_use]
    pub fn with_continuation(mut self, token: Option<ContinuationToken>) -> Self {
        self.continuation = token;
        self
    }

    /// Set page size
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Page size after defaults and clamping
    #[must_use]
    pub fn effective_page_size(&self) -> usize {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    /// Decoded resume position
    ///
    /// # Errors
    ///
    /// Returns error if the continuation token is malformed
    pub fn resume_after(&self) -> CoreResult<Option<ResourceId>> {
        self.continuation
            .as_ref()
            .map(ContinuationToken::resume_after)
            .transpose()
    }
}

/// Options for point reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadOptions {
    /// Skip the body if the stored etag still matches
    pub if_none_match: Option<Etag>,
}

/// Options for document creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOptions {
    /// Fail instead of generating an id for documents without one
    pub disable_automatic_id_generation: bool,
    /// Overwrite an existing document with the same id
    pub upsert: bool,
}

/// Options for replace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceOptions {
    /// Only replace if the stored etag matches
    pub if_match: Option<Etag>,
}

/// Options for delete
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    /// Only delete if the stored etag matches
    pub if_match: Option<Etag>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_continuation_roundtrip() {
        let id = ResourceId::parse("doc-17").unwrap();
        let token = ContinuationToken::after(&id);
        assert_eq!(token.resume_after().unwrap(), id);
    }

    #[test]
    fn test_continuation_rejects_garbage() {
        let token = ContinuationToken::from_raw("not-hex");
        assert!(matches!(
            token.resume_after(),
            Err(CoreError::InvalidContinuation { .. })
        ));

        let token = ContinuationToken::from_raw(hex::encode(b"{\"v\":9,\"after\":\"a\"}"));
        assert!(token.resume_after().is_err());
    }

    #[test]
    fn test_effective_page_size() {
        assert_eq!(FeedOptions::new().effective_page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(FeedOptions::new().with_page_size(0).effective_page_size(), 1);
        assert_eq!(
            FeedOptions::new().with_page_size(5000).effective_page_size(),
            MAX_PAGE_SIZE
        );
    }

    #[test]
    fn test_feed_options_resume_after() {
        let opts = FeedOptions::new();
        assert_eq!(opts.resume_after().unwrap(), None);

        let id = ResourceId::parse("x").unwrap();
        let opts = opts.with_continuation(Some(ContinuationToken::after(&id)));
        assert_eq!(opts.resume_after().unwrap(), Some(id));
    }

    #[test]
    fn test_options_deserialize_camel_case() {
        let opts: CreateOptions =
            serde_json::from_str(r#"{"disableAutomaticIdGeneration":true,"upsert":false}"#)
                .unwrap();
        assert!(opts.disable_automatic_id_generation);
    }

    proptest! {
        #[test]
        fn test_page_size_always_in_bounds(size in any::<usize>()) {
            let page = FeedOptions::new().with_page_size(size).effective_page_size();
            prop_assert!((1..=MAX_PAGE_SIZE).contains(&page));
        }

        #[test]
        fn test_continuation_resumes_after_any_valid_id(id in "[a-z0-9_-]{1,64}") {
            let id = ResourceId::parse(id).unwrap();
            prop_assert_eq!(ContinuationToken::after(&id).resume_after().unwrap(), id);
        }
    }
}
