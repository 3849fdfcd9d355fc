//! Explicit invocation context handed to scripts.

use crate::admission::{AdmissionDecision, AdmissionGate};
use crate::deadline::DeadlineMonitor;
use crate::monitor::{InvocationRecorder, JournalEvent};
use crate::queue::{CallbackTag, Completion, OperationQueue, OperationRequest};
use serde_json::Value;
use sprocket_core::{
    Attachment, CollectionLink, CreateOptions, DeleteOptions, Document, FeedOptions,
    InvocationId, Query, ReadOptions, ReplaceOptions, ResourceId,
};
use std::time::Duration;

/// Request of an invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    body: Value,
}

impl Request {
    /// Wrap a request body
    #[must_use]
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    /// Request body
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Replace the request body
    pub fn set_body(&mut self, body: Value) {
        self.body = body;
    }
}

/// Response of an invocation; unset unless the script sets it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    body: Option<Value>,
}

impl Response {
    /// Response body, if set
    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Set the response body
    pub fn set_body(&mut self, body: impl Into<Value>) {
        self.body = Some(body.into());
    }

    pub(crate) fn into_body(self) -> Option<Value> {
        self.body
    }
}

/// Collection an invocation is bound to.
///
/// Every operation passes the admission gate before it is queued; the
/// returned decision is final. After a rejection the script should stop
/// submitting and record its progress in the response.
#[derive(Debug)]
pub struct Collection {
    invocation: InvocationId,
    link: CollectionLink,
    monitor: DeadlineMonitor,
    gate: AdmissionGate,
    queue: OperationQueue,
    recorder: InvocationRecorder,
}

impl Collection {
    pub(crate) fn new(
        invocation: InvocationId,
        link: CollectionLink,
        monitor: DeadlineMonitor,
        gate: AdmissionGate,
        recorder: InvocationRecorder,
    ) -> Self {
        Self {
            invocation,
            link,
            monitor,
            gate,
            queue: OperationQueue::new(),
            recorder,
        }
    }

    /// Link of the bound collection
    #[must_use]
    pub fn self_link(&self) -> &CollectionLink {
        &self.link
    }

    /// Budget left
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.monitor.remaining()
    }

    /// Operations queued or running
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    /// Whether the gate has closed
    #[must_use]
    pub fn is_latched(&self) -> bool {
        self.gate.is_latched()
    }

    /// Submit an operation through the admission gate
    pub fn submit(
        &mut self,
        link: &CollectionLink,
        request: OperationRequest,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        let kind = request.kind();
        let decision = self
            .gate
            .admit(&self.monitor, &mut self.queue, link.clone(), request, tag);
        let at = self.monitor.elapsed();

        match &decision {
            AdmissionDecision::Accepted(operation) => {
                tracing::debug!(invocation = %self.invocation, op = %operation, %kind, "admitted");
                self.recorder.record(JournalEvent::Admitted {
                    operation: *operation,
                    kind,
                    at,
                });
            }
            AdmissionDecision::Rejected(reason) => {
                tracing::debug!(invocation = %self.invocation, %kind, %reason, "rejected");
                self.recorder.record(JournalEvent::Rejected {
                    kind,
                    reason: reason.clone(),
                    at,
                });
            }
        }
        decision
    }

    /// Create a document
    pub fn create_document(
        &mut self,
        link: &CollectionLink,
        document: Document,
        options: CreateOptions,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        self.submit(link, OperationRequest::CreateDocument { document, options }, tag)
    }

    /// Replace a document
    pub fn replace_document(
        &mut self,
        link: &CollectionLink,
        id: ResourceId,
        document: Document,
        options: ReplaceOptions,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        self.submit(
            link,
            OperationRequest::ReplaceDocument {
                id,
                document,
                options,
            },
            tag,
        )
    }

    /// Delete a document and its attachments
    pub fn delete_document(
        &mut self,
        link: &CollectionLink,
        id: ResourceId,
        options: DeleteOptions,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        self.submit(link, OperationRequest::DeleteDocument { id, options }, tag)
    }

    /// Read a document
    pub fn read_document(
        &mut self,
        link: &CollectionLink,
        id: ResourceId,
        options: ReadOptions,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        self.submit(link, OperationRequest::ReadDocument { id, options }, tag)
    }

    /// Read one page of the collection
    pub fn read_documents(
        &mut self,
        link: &CollectionLink,
        options: FeedOptions,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        self.submit(link, OperationRequest::ReadDocuments { options }, tag)
    }

    /// Read one page of documents matching a filter
    pub fn query_documents(
        &mut self,
        link: &CollectionLink,
        query: Query,
        options: FeedOptions,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        self.submit(link, OperationRequest::QueryDocuments { query, options }, tag)
    }

    /// Create an attachment on a document
    pub fn create_attachment(
        &mut self,
        link: &CollectionLink,
        document: ResourceId,
        attachment: Attachment,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        self.submit(
            link,
            OperationRequest::CreateAttachment {
                document,
                attachment,
            },
            tag,
        )
    }

    /// Read an attachment
    pub fn read_attachment(
        &mut self,
        link: &CollectionLink,
        document: ResourceId,
        id: ResourceId,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        self.submit(link, OperationRequest::ReadAttachment { document, id }, tag)
    }

    /// Delete an attachment
    pub fn delete_attachment(
        &mut self,
        link: &CollectionLink,
        document: ResourceId,
        id: ResourceId,
        tag: CallbackTag,
    ) -> AdmissionDecision {
        self.submit(link, OperationRequest::DeleteAttachment { document, id }, tag)
    }

    pub(crate) fn queue_mut(&mut self) -> &mut OperationQueue {
        &mut self.queue
    }

    /// Book-keeping for a completion about to be delivered
    pub(crate) fn settle(&mut self, completion: &Completion) {
        self.queue.complete();
        self.gate.observe_latency(completion.latency);
        let status = match &completion.result {
            Ok(_) => 200,
            Err(err) => err.status_code(),
        };
        tracing::debug!(
            invocation = %self.invocation,
            op = %completion.operation,
            status,
            latency = ?completion.latency,
            "completed"
        );
        self.recorder.record(JournalEvent::Completed {
            operation: completion.operation,
            kind: completion.kind,
            status,
            latency: completion.latency,
        });
    }

    /// Close the gate and drop whatever is still queued
    pub(crate) fn cancel_pending(&mut self) -> usize {
        self.gate.latch();
        self.queue.cancel_all()
    }

    pub(crate) fn into_recorder(self) -> InvocationRecorder {
        self.recorder
    }
}

/// Everything a script can reach during one invocation
#[derive(Debug)]
pub struct Context {
    invocation: InvocationId,
    collection: Collection,
    request: Request,
    response: Response,
}

impl Context {
    pub(crate) fn new(invocation: InvocationId, collection: Collection, request: Request) -> Self {
        Self {
            invocation,
            collection,
            request,
            response: Response::default(),
        }
    }

    /// Invocation id
    #[must_use]
    pub const fn invocation(&self) -> InvocationId {
        self.invocation
    }

    /// Bound collection
    #[must_use]
    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// Bound collection, for submitting operations
    pub fn collection_mut(&mut self) -> &mut Collection {
        &mut self.collection
    }

    /// Request
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Request, mutable
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    /// Response
    #[must_use]
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Response, mutable
    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub(crate) fn into_parts(self) -> (Collection, Response) {
        (self.collection, self.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionConfig, RejectReason};
    use crate::deadline::DEFAULT_BUDGET;
    use serde_json::json;
    use sprocket_core::ManualClock;

    fn context(gate: AdmissionGate) -> Context {
        let invocation = InvocationId::new();
        let link = CollectionLink::parse("orders").unwrap();
        let monitor = DeadlineMonitor::new(ManualClock::shared(), DEFAULT_BUDGET);
        let collection =
            Collection::new(invocation, link, monitor, gate, InvocationRecorder::default());
        Context::new(invocation, collection, Request::new(json!({"n": 1})))
    }

    #[test]
    fn test_request_and_response() {
        let mut ctx = context(AdmissionGate::default());
        assert_eq!(ctx.request().body()["n"], 1);
        assert!(ctx.response().body().is_none());

        ctx.request_mut().set_body(json!([]));
        ctx.response_mut().set_body(3);
        assert_eq!(ctx.request().body(), &json!([]));
        assert_eq!(ctx.response().body(), Some(&json!(3)));
    }

    #[test]
    fn test_submissions_are_journaled() {
        let gate = AdmissionGate::new(AdmissionConfig::default().with_max_pending(1));
        let mut ctx = context(gate);
        let link = ctx.collection().self_link().clone();

        let first = ctx.collection_mut().read_documents(&link, FeedOptions::default(), 0);
        let second = ctx.collection_mut().read_documents(&link, FeedOptions::default(), 1);
        assert!(first.is_accepted());
        assert_eq!(
            second.reject_reason(),
            Some(&RejectReason::QueueFull { limit: 1 })
        );
        assert!(ctx.collection().is_latched());
        assert_eq!(ctx.collection().pending(), 1);

        let (collection, _) = ctx.into_parts();
        let (metrics, journal) = collection.into_recorder().into_parts();
        assert_eq!(metrics.operations_accepted, 1);
        assert_eq!(metrics.operations_rejected, 1);
        assert_eq!(journal.len(), 2);
    }

    #[test]
    fn test_cancel_pending_latches() {
        let mut ctx = context(AdmissionGate::default());
        let link = ctx.collection().self_link().clone();
        let id = ResourceId::parse("a").unwrap();
        ctx.collection_mut()
            .read_document(&link, id.clone(), ReadOptions::default(), 0);

        assert_eq!(ctx.collection_mut().cancel_pending(), 1);
        let decision = ctx
            .collection_mut()
            .read_document(&link, id, ReadOptions::default(), 1);
        assert_eq!(decision.reject_reason(), Some(&RejectReason::Latched));
    }
}
