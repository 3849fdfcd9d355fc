//! Store contract shared by all backends.

use crate::batch::{ResourceKey, WriteBatch};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sprocket_core::{Attachment, CollectionLink, CoreError, Document, ResourceId};
use std::sync::Arc;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum encoded document size in bytes (0 = unlimited)
    pub max_document_size: usize,
    /// Maximum number of attachments per document (0 = unlimited)
    pub max_attachments: usize,
}

impl StoreConfig {
    /// Set maximum document size
    #[must_use]
    pub fn with_max_document_size(mut self, bytes: usize) -> Self {
        self.max_document_size = bytes;
        self
    }

    /// Set maximum attachments per document
    #[must_use]
    pub fn with_max_attachments(mut self, count: usize) -> Self {
        self.max_attachments = count;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_document_size: 2 * 1024 * 1024, // 2 MB
            max_attachments: 100,
        }
    }
}

/// Store error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A write's precondition did not hold at commit time
    #[error("Commit conflict on {key}")]
    Conflict {
        /// Conflicting resource
        key: String,
    },

    /// Stored bytes could not be decoded
    #[error("Corrupt record {key}: {reason}")]
    Corrupt {
        /// Offending record
        key: String,
        /// Decoder message
        reason: String,
    },

    /// Backend I/O failure
    #[error("Backend error: {reason}")]
    Backend {
        /// Backend message
        reason: String,
    },

    /// Request rejected by the store
    #[error(transparent)]
    Rejected(#[from] CoreError),
}

impl StoreError {
    /// Wrap any backend error
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend {
            reason: err.to_string(),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(inner) => inner,
            StoreError::Conflict { key } => CoreError::PreconditionFailed { id: key },
            other => CoreError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of documents across collections
    pub document_count: usize,
    /// Number of attachments across collections
    pub attachment_count: usize,
    /// Batches committed
    pub commits: u64,
    /// Batches refused because a precondition failed
    pub conflicts: u64,
}

/// Result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// Writes applied
    pub writes: usize,
}

/// Backing store for documents and attachments.
///
/// Reads see committed state only. The single mutation path is
/// [`DocumentStore::commit`]: every precondition in the batch is checked and
/// then every write is applied, or nothing is applied at all.
#[async_trait]
pub trait DocumentStore: Send + Sync + std::fmt::Debug {
    /// Read one document
    async fn get_document(
        &self,
        collection: &CollectionLink,
        id: &ResourceId,
    ) -> Result<Option<Document>, StoreError>;

    /// Documents of a collection in id order, strictly after `after`
    async fn scan_documents(
        &self,
        collection: &CollectionLink,
        after: Option<&ResourceId>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError>;

    /// Read one attachment
    async fn get_attachment(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
        id: &ResourceId,
    ) -> Result<Option<Attachment>, StoreError>;

    /// All attachments of a document, in id order
    async fn list_attachments(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
    ) -> Result<Vec<Attachment>, StoreError>;

    /// Apply a batch atomically
    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError>;

    /// Current statistics
    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Shared handle to a store
pub type SharedStore = Arc<dyn DocumentStore>;

/// Read the current value behind a key
pub(crate) async fn load(
    store: &dyn DocumentStore,
    key: &ResourceKey,
) -> Result<Option<crate::batch::Resource>, StoreError> {
    use crate::batch::Resource;
    match key {
        ResourceKey::Document { collection, id } => Ok(store
            .get_document(collection, id)
            .await?
            .map(Resource::Document)),
        ResourceKey::Attachment {
            collection,
            document,
            id,
        } => Ok(store
            .get_attachment(collection, document, id)
            .await?
            .map(Resource::Attachment)),
    }
}
