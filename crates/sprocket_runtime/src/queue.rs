//! Operation queue and completion protocol.
//!
//! Accepted operations wait here in submission order until the host starts
//! them. Every started operation produces exactly one [`Completion`], which
//! the host hands back to the script.

use serde::{Deserialize, Serialize};
use sprocket_core::{
    Attachment, CollectionLink, CoreError, CreateOptions, DeleteOptions, Document, FeedOptions,
    OperationId, Query, ReadOptions, ReplaceOptions, ResourceId,
};
use sprocket_storage::{Page, StagedView, StoreError};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Caller-chosen value identifying which continuation a completion resumes
pub type CallbackTag = u64;

/// Kind of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    /// Create (or upsert) a document
    CreateDocument,
    /// Replace a document
    ReplaceDocument,
    /// Delete a document
    DeleteDocument,
    /// Point read of a document
    ReadDocument,
    /// Feed read of a collection
    ReadDocuments,
    /// Filtered feed read
    QueryDocuments,
    /// Create an attachment
    CreateAttachment,
    /// Read an attachment
    ReadAttachment,
    /// Delete an attachment
    DeleteAttachment,
}

impl OperationKind {
    /// Whether the operation stages a write
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            Self::CreateDocument
                | Self::ReplaceDocument
                | Self::DeleteDocument
                | Self::CreateAttachment
                | Self::DeleteAttachment
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateDocument => "createDocument",
            Self::ReplaceDocument => "replaceDocument",
            Self::DeleteDocument => "deleteDocument",
            Self::ReadDocument => "readDocument",
            Self::ReadDocuments => "readDocuments",
            Self::QueryDocuments => "queryDocuments",
            Self::CreateAttachment => "createAttachment",
            Self::ReadAttachment => "readAttachment",
            Self::DeleteAttachment => "deleteAttachment",
        };
        f.write_str(name)
    }
}

/// Payload of an operation
#[derive(Debug, Clone, PartialEq)]
pub enum OperationRequest {
    /// Create a document
    CreateDocument {
        /// Body
        document: Document,
        /// Options
        options: CreateOptions,
    },
    /// Replace a document
    ReplaceDocument {
        /// Target id
        id: ResourceId,
        /// New body
        document: Document,
        /// Options
        options: ReplaceOptions,
    },
    /// Delete a document
    DeleteDocument {
        /// Target id
        id: ResourceId,
        /// Options
        options: DeleteOptions,
    },
    /// Point read
    ReadDocument {
        /// Target id
        id: ResourceId,
        /// Options
        options: ReadOptions,
    },
    /// Feed read
    ReadDocuments {
        /// Options
        options: FeedOptions,
    },
    /// Filtered feed read
    QueryDocuments {
        /// Filter
        query: Query,
        /// Options
        options: FeedOptions,
    },
    /// Create an attachment
    CreateAttachment {
        /// Parent document
        document: ResourceId,
        /// Attachment metadata
        attachment: Attachment,
    },
    /// Read an attachment
    ReadAttachment {
        /// Parent document
        document: ResourceId,
        /// Attachment id
        id: ResourceId,
    },
    /// Delete an attachment
    DeleteAttachment {
        /// Parent document
        document: ResourceId,
        /// Attachment id
        id: ResourceId,
    },
}

impl OperationRequest {
    /// Kind of this request
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::CreateDocument { .. } => OperationKind::CreateDocument,
            Self::ReplaceDocument { .. } => OperationKind::ReplaceDocument,
            Self::DeleteDocument { .. } => OperationKind::DeleteDocument,
            Self::ReadDocument { .. } => OperationKind::ReadDocument,
            Self::ReadDocuments { .. } => OperationKind::ReadDocuments,
            Self::QueryDocuments { .. } => OperationKind::QueryDocuments,
            Self::CreateAttachment { .. } => OperationKind::CreateAttachment,
            Self::ReadAttachment { .. } => OperationKind::ReadAttachment,
            Self::DeleteAttachment { .. } => OperationKind::DeleteAttachment,
        }
    }
}

/// An accepted operation
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Sequence number within the invocation
    pub id: OperationId,
    /// Target collection
    pub collection: CollectionLink,
    /// Payload
    pub request: OperationRequest,
    /// Continuation to resume on completion
    pub tag: CallbackTag,
}

impl Operation {
    /// Kind of this operation
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.request.kind()
    }

    /// Run against the invocation's staged view
    ///
    /// # Errors
    ///
    /// Returns `OperationError::Failed` with the status of the rejection.
    pub async fn execute(self, view: &StagedView) -> Result<OperationOutput, OperationError> {
        let coll = &self.collection;
        let output = match self.request {
            OperationRequest::CreateDocument { document, options } => {
                OperationOutput::Document(view.create_document(coll, document, &options).await?)
            }
            OperationRequest::ReplaceDocument {
                id,
                document,
                options,
            } => OperationOutput::Document(
                view.replace_document(coll, &id, document, &options)
                    .await?,
            ),
            OperationRequest::DeleteDocument { id, options } => {
                view.delete_document(coll, &id, &options).await?;
                OperationOutput::Deleted
            }
            OperationRequest::ReadDocument { id, options } => {
                match view.read_document(coll, &id, &options).await? {
                    Some(doc) => OperationOutput::Document(doc),
                    None => OperationOutput::NotModified,
                }
            }
            OperationRequest::ReadDocuments { options } => {
                OperationOutput::Feed(view.read_documents(coll, &options).await?)
            }
            OperationRequest::QueryDocuments { query, options } => {
                OperationOutput::Feed(view.query_documents(coll, &query, &options).await?)
            }
            OperationRequest::CreateAttachment {
                document,
                attachment,
            } => OperationOutput::Attachment(
                view.create_attachment(coll, &document, attachment)
                    .await?,
            ),
            OperationRequest::ReadAttachment { document, id } => {
                OperationOutput::Attachment(view.read_attachment(coll, &document, &id).await?)
            }
            OperationRequest::DeleteAttachment { document, id } => {
                view.delete_attachment(coll, &document, &id).await?;
                OperationOutput::Deleted
            }
        };
        Ok(output)
    }
}

/// Successful result of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum OperationOutput {
    /// Document written or read
    Document(Document),
    /// `if_none_match` etag is current
    NotModified,
    /// Resource deleted
    Deleted,
    /// One page of a feed
    Feed(Page<Document>),
    /// Attachment written or read
    Attachment(Attachment),
}

impl OperationOutput {
    /// Document carried by the output
    #[must_use]
    pub fn document(&self) -> Option<&Document> {
        match self {
            Self::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// Feed page carried by the output
    #[must_use]
    pub fn feed(&self) -> Option<&Page<Document>> {
        match self {
            Self::Feed(page) => Some(page),
            _ => None,
        }
    }

    /// Take the feed page out of the output
    #[must_use]
    pub fn into_feed(self) -> Option<Page<Document>> {
        match self {
            Self::Feed(page) => Some(page),
            _ => None,
        }
    }
}

/// Failure delivered to a completion callback
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// The store refused the operation
    #[error("operation failed with status {status}: {error}")]
    Failed {
        /// HTTP-style status code
        status: u16,
        /// Underlying error
        error: CoreError,
    },

    /// The operation outlived the remaining budget
    #[error("operation did not finish within the remaining budget")]
    TimedOut,
}

impl OperationError {
    /// HTTP-style status code
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Failed { status, .. } => *status,
            Self::TimedOut => 408,
        }
    }
}

impl From<CoreError> for OperationError {
    fn from(error: CoreError) -> Self {
        Self::Failed {
            status: error.status_code(),
            error,
        }
    }
}

impl From<StoreError> for OperationError {
    fn from(err: StoreError) -> Self {
        CoreError::from(err).into()
    }
}

/// Outcome of one operation, delivered exactly once
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Completed operation
    pub operation: OperationId,
    /// Its kind
    pub kind: OperationKind,
    /// Continuation tag given at submission
    pub tag: CallbackTag,
    /// Result
    pub result: Result<OperationOutput, OperationError>,
    /// Time from start to completion
    pub latency: Duration,
}

impl Completion {
    /// Whether the operation succeeded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Order in which completions reach the script
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompletionOrder {
    /// Submission order, whatever order operations actually finish in
    #[default]
    Submission,
    /// As soon as each operation finishes
    AsCompleted,
}

/// FIFO of accepted operations
#[derive(Debug)]
pub struct OperationQueue {
    queued: VecDeque<Operation>,
    in_flight: usize,
    next_id: OperationId,
    started: u64,
    completed: u64,
}

impl OperationQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self {
            queued: VecDeque::new(),
            in_flight: 0,
            next_id: OperationId::first(),
            started: 0,
            completed: 0,
        }
    }

    /// Append an accepted operation
    pub fn enqueue(
        &mut self,
        collection: CollectionLink,
        request: OperationRequest,
        tag: CallbackTag,
    ) -> OperationId {
        let id = self.next_id;
        self.next_id = id.next();
        self.queued.push_back(Operation {
            id,
            collection,
            request,
            tag,
        });
        id
    }

    /// Operations queued or running
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queued.len() + self.in_flight
    }

    /// Operations waiting to start
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    /// Operations started and not yet completed
    #[must_use]
    pub const fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether nothing is queued or running
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Take the oldest queued operation if fewer than `max_in_flight` run
    pub fn start_next(&mut self, max_in_flight: usize) -> Option<Operation> {
        if self.in_flight >= max_in_flight.max(1) {
            return None;
        }
        let op = self.queued.pop_front()?;
        self.in_flight += 1;
        self.started += 1;
        Some(op)
    }

    /// Record that a started operation delivered its completion
    pub fn complete(&mut self) {
        debug_assert!(self.in_flight > 0, "completion without a running operation");
        self.in_flight = self.in_flight.saturating_sub(1);
        self.completed += 1;
    }

    /// Drop every queued operation and forget running ones
    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.queued.len() + self.in_flight;
        self.queued.clear();
        self.in_flight = 0;
        dropped
    }

    /// Operations started so far
    #[must_use]
    pub const fn started(&self) -> u64 {
        self.started
    }

    /// Completions delivered so far
    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.completed
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sprocket_storage::{MemoryStore, StoreConfig};
    use std::sync::Arc;

    fn coll() -> CollectionLink {
        CollectionLink::parse("orders").unwrap()
    }

    fn create(id: &str) -> OperationRequest {
        OperationRequest::CreateDocument {
            document: Document::from_value(json!({"id": id})).unwrap(),
            options: CreateOptions::default(),
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = OperationQueue::new();
        let a = queue.enqueue(coll(), create("a"), 1);
        let b = queue.enqueue(coll(), create("b"), 2);
        assert_eq!(queue.pending(), 2);

        let first = queue.start_next(8).unwrap();
        let second = queue.start_next(8).unwrap();
        assert_eq!((first.id, first.tag), (a, 1));
        assert_eq!((second.id, second.tag), (b, 2));
        assert_eq!(queue.in_flight(), 2);
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    fn test_queue_respects_in_flight_limit() {
        let mut queue = OperationQueue::new();
        queue.enqueue(coll(), create("a"), 0);
        queue.enqueue(coll(), create("b"), 0);

        assert!(queue.start_next(1).is_some());
        assert!(queue.start_next(1).is_none());
        queue.complete();
        assert!(queue.start_next(1).is_some());
        queue.complete();
        assert!(queue.is_idle());
        assert_eq!(queue.started(), 2);
        assert_eq!(queue.completed(), 2);
    }

    #[test]
    fn test_zero_in_flight_limit_still_progresses() {
        let mut queue = OperationQueue::new();
        queue.enqueue(coll(), create("a"), 0);
        assert!(queue.start_next(0).is_some());
    }

    #[test]
    fn test_cancel_all() {
        let mut queue = OperationQueue::new();
        queue.enqueue(coll(), create("a"), 0);
        queue.enqueue(coll(), create("b"), 0);
        queue.start_next(1);
        assert_eq!(queue.cancel_all(), 2);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_operation_ids_increase() {
        let mut queue = OperationQueue::new();
        let a = queue.enqueue(coll(), create("a"), 0);
        let b = queue.enqueue(coll(), create("b"), 0);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_kind_classification() {
        assert!(OperationKind::CreateDocument.is_write());
        assert!(OperationKind::DeleteAttachment.is_write());
        assert!(!OperationKind::QueryDocuments.is_write());
        assert_eq!(OperationKind::ReadDocuments.to_string(), "readDocuments");
        assert_eq!(create("a").kind(), OperationKind::CreateDocument);
    }

    #[test]
    fn test_error_status_codes() {
        let err: OperationError = CoreError::document_not_found("a").into();
        assert_eq!(err.status_code(), 404);
        assert_eq!(OperationError::TimedOut.status_code(), 408);
    }

    #[tokio::test]
    async fn test_execute_against_view() {
        let view = StagedView::new(Arc::new(MemoryStore::new()), StoreConfig::default());
        let mut queue = OperationQueue::new();
        queue.enqueue(coll(), create("a"), 0);
        queue.enqueue(coll(), create("a"), 1);

        let created = queue.start_next(1).unwrap().execute(&view).await.unwrap();
        assert_eq!(
            created.document().and_then(Document::id),
            Some(ResourceId::parse("a").unwrap())
        );
        queue.complete();

        let err = queue.start_next(1).unwrap().execute(&view).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn test_execute_feed() {
        let view = StagedView::new(Arc::new(MemoryStore::new()), StoreConfig::default());
        let mut queue = OperationQueue::new();
        queue.enqueue(coll(), create("a"), 0);
        queue.enqueue(
            coll(),
            OperationRequest::ReadDocuments {
                options: FeedOptions::default(),
            },
            1,
        );

        queue.start_next(1).unwrap().execute(&view).await.unwrap();
        queue.complete();
        let page = queue
            .start_next(1)
            .unwrap()
            .execute(&view)
            .await
            .unwrap()
            .into_feed()
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(!page.has_more());
    }
}
