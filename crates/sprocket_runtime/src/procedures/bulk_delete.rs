//! Bulk delete: remove every document matching a filter.
//!
//! Request body: `{"query": Query, "pageSize": n}`, both optional. The script
//! alternates between fetching a page of matches and deleting it one document
//! at a time. Response: `{"deleted": n, "continuation": bool}`, where
//! `continuation` tells the caller that matches may remain.

use crate::admission::AdmissionDecision;
use crate::context::Context;
use crate::queue::{CallbackTag, Completion, OperationOutput};
use crate::script::{Script, ScriptError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sprocket_core::{DeleteOptions, Document, FeedOptions, Query, ResourceId};
use std::collections::VecDeque;

const QUERY_TAG: CallbackTag = 0;
const DELETE_TAG: CallbackTag = 1;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DeleteBody {
    query: Query,
    page_size: Option<usize>,
}

/// Response of a bulk delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteProgress {
    /// Documents deleted by this invocation
    pub deleted: u64,
    /// Whether matching documents may remain
    pub continuation: bool,
}

/// Cursor of a bulk delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteState {
    /// Nothing submitted yet
    Pending,
    /// Waiting for a page of matches
    Querying,
    /// Waiting for one delete
    Deleting,
    /// Finished
    Done,
    /// An operation failed
    Aborted,
}

/// Bulk delete procedure
#[derive(Debug)]
pub struct BulkDelete {
    query: Query,
    feed: FeedOptions,
    batch: VecDeque<(ResourceId, DeleteOptions)>,
    progress: DeleteProgress,
    state: DeleteState,
}

impl BulkDelete {
    /// Create a delete waiting for its request
    #[must_use]
    pub fn new() -> Self {
        Self {
            query: Query::All,
            feed: FeedOptions::default(),
            batch: VecDeque::new(),
            progress: DeleteProgress::default(),
            state: DeleteState::Pending,
        }
    }

    /// Current cursor state
    #[must_use]
    pub const fn state(&self) -> DeleteState {
        self.state
    }

    /// Progress so far
    #[must_use]
    pub const fn progress(&self) -> DeleteProgress {
        self.progress
    }

    fn finish(&mut self, ctx: &mut Context, continuation: bool) -> Result<(), ScriptError> {
        self.progress.continuation = continuation;
        let body = serde_json::to_value(self.progress)
            .map_err(|e| ScriptError::raise(e.to_string()))?;
        ctx.response_mut().set_body(body);
        self.state = DeleteState::Done;
        Ok(())
    }

    fn query_page(&mut self, ctx: &mut Context) -> Result<(), ScriptError> {
        let link = ctx.collection().self_link().clone();
        // deletions are visible to the staged view, so every page starts over
        match ctx
            .collection_mut()
            .query_documents(&link, self.query.clone(), self.feed.clone(), QUERY_TAG)
        {
            AdmissionDecision::Accepted(_) => {
                self.state = DeleteState::Querying;
                Ok(())
            }
            AdmissionDecision::Rejected(_) => self.finish(ctx, true),
        }
    }

    fn delete_next(&mut self, ctx: &mut Context) -> Result<(), ScriptError> {
        let Some((id, options)) = self.batch.pop_front() else {
            return self.query_page(ctx);
        };
        let link = ctx.collection().self_link().clone();
        match ctx
            .collection_mut()
            .delete_document(&link, id, options, DELETE_TAG)
        {
            AdmissionDecision::Accepted(_) => {
                self.state = DeleteState::Deleting;
                Ok(())
            }
            AdmissionDecision::Rejected(_) => self.finish(ctx, true),
        }
    }

    fn on_page(&mut self, ctx: &mut Context, items: Vec<Document>) -> Result<(), ScriptError> {
        if items.is_empty() {
            return self.finish(ctx, false);
        }
        for doc in items {
            let id = doc
                .id()
                .ok_or_else(|| ScriptError::raise("stored document without an id"))?;
            let options = DeleteOptions {
                if_match: doc.etag(),
            };
            self.batch.push_back((id, options));
        }
        self.delete_next(ctx)
    }
}

impl Default for BulkDelete {
    fn default() -> Self {
        Self::new()
    }
}

impl Script for BulkDelete {
    fn run(&mut self, ctx: &mut Context) -> Result<(), ScriptError> {
        let body = match ctx.request().body() {
            Value::Null => DeleteBody::default(),
            value => serde_json::from_value::<DeleteBody>(value.clone())
                .map_err(|e| ScriptError::invalid_request(e.to_string()))?,
        };
        self.query = body.query;
        if let Some(size) = body.page_size {
            self.feed = FeedOptions::new().with_page_size(size);
        }
        self.query_page(ctx)
    }

    fn on_complete(&mut self, ctx: &mut Context, completion: Completion) -> Result<(), ScriptError> {
        let expected = match self.state {
            DeleteState::Querying => QUERY_TAG,
            DeleteState::Deleting => DELETE_TAG,
            state => {
                self.state = DeleteState::Aborted;
                return Err(ScriptError::raise(format!(
                    "unexpected completion {} in state {state:?}",
                    completion.operation
                )));
            }
        };
        if completion.tag != expected {
            self.state = DeleteState::Aborted;
            return Err(ScriptError::raise(format!(
                "completion {} carries tag {}, expected {expected}",
                completion.operation, completion.tag
            )));
        }

        match completion.result {
            Err(err) => {
                self.state = DeleteState::Aborted;
                Err(err.into())
            }
            Ok(OperationOutput::Feed(page)) => self.on_page(ctx, page.items),
            Ok(_) => {
                self.progress.deleted += 1;
                self.delete_next(ctx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::host::{HostConfig, ScriptHost};
    use crate::procedures::{BULK_DELETE, BULK_IMPORT};
    use serde_json::json;
    use sprocket_core::{CollectionLink, ManualClock};
    use sprocket_storage::{MemoryStore, SimulatedStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn coll() -> CollectionLink {
        CollectionLink::parse("events").unwrap()
    }

    async fn seed(host: &ScriptHost, count: usize) {
        let docs: Vec<Value> = (0..count)
            .map(|n| json!({"id": format!("e{n:03}"), "parity": if n % 2 == 0 { "even" } else { "odd" }}))
            .collect();
        let outcome = host
            .execute(BULK_IMPORT, &coll(), Value::Array(docs))
            .await
            .unwrap();
        assert!(outcome.is_committed());
    }

    fn progress(value: Option<Value>) -> DeleteProgress {
        serde_json::from_value(value.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_deletes_matching_across_pages() {
        let store = Arc::new(MemoryStore::new());
        let host = ScriptHost::new(store.clone(), HostConfig::default());
        seed(&host, 30).await;

        let outcome = host
            .execute(
                BULK_DELETE,
                &coll(),
                json!({"query": {"op": "eq", "path": "parity", "value": "odd"}, "pageSize": 4}),
            )
            .await
            .unwrap();
        assert!(outcome.is_committed());
        assert_eq!(
            progress(outcome.response),
            DeleteProgress {
                deleted: 15,
                continuation: false
            }
        );

        let left = store.documents(&coll()).await;
        assert_eq!(left.len(), 15);
        assert!(left.iter().all(|d| d.get("parity") == Some(&json!("even"))));
    }

    #[tokio::test]
    async fn test_null_body_deletes_everything() {
        let store = Arc::new(MemoryStore::new());
        let host = ScriptHost::new(store.clone(), HostConfig::default());
        seed(&host, 5).await;

        let outcome = host.execute(BULK_DELETE, &coll(), Value::Null).await.unwrap();
        assert_eq!(progress(outcome.response).deleted, 5);
        assert_eq!(store.count(&coll()).await, 0);
    }

    #[tokio::test]
    async fn test_empty_collection() {
        let store = Arc::new(MemoryStore::new());
        let host = ScriptHost::new(store, HostConfig::default());

        let outcome = host.execute(BULK_DELETE, &coll(), json!({})).await.unwrap();
        assert_eq!(
            progress(outcome.response),
            DeleteProgress {
                deleted: 0,
                continuation: false
            }
        );
    }

    #[tokio::test]
    async fn test_rejection_reports_continuation() {
        let clock = ManualClock::shared();
        let memory = Arc::new(MemoryStore::new());
        let seeding = ScriptHost::new(memory.clone(), HostConfig::default());
        seed(&seeding, 20).await;

        let store = Arc::new(
            SimulatedStore::new(memory.clone(), clock.clone())
                .with_latency(Duration::from_millis(400)),
        );
        let config = HostConfig::default().with_admission(
            AdmissionConfig::default()
                .with_latency_estimate(Duration::from_millis(400))
                .with_latency_floor(Duration::from_millis(400)),
        );
        let host = ScriptHost::new(store, config).with_clock(clock);

        let mut total = 0;
        let mut rounds = 0;
        loop {
            let outcome = host.execute(BULK_DELETE, &coll(), json!({})).await.unwrap();
            assert!(outcome.is_committed());
            let step = progress(outcome.response);
            total += step.deleted;
            rounds += 1;
            if !step.continuation {
                break;
            }
            assert!(step.deleted > 0);
        }
        assert_eq!(total, 20);
        assert!(rounds > 1);
        assert_eq!(memory.count(&coll()).await, 0);
    }

    #[tokio::test]
    async fn test_invalid_body() {
        let store = Arc::new(MemoryStore::new());
        let host = ScriptHost::new(store, HostConfig::default());
        let outcome = host
            .execute(BULK_DELETE, &coll(), json!({"query": {"op": "sql"}}))
            .await
            .unwrap();
        assert!(!outcome.is_committed());
        assert!(outcome.response.is_none());
    }
}
