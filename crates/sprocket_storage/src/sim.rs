//! Simulated store for deterministic tests.
//!
//! Wraps another store, charges a fixed latency to a [`ManualClock`] on
//! every call, and injects failures on demand. Nothing here sleeps: time
//! only moves when the wrapper advances the clock.

use crate::batch::WriteBatch;
use crate::store::{CommitReceipt, DocumentStore, SharedStore, StoreError, StoreStats};
use async_trait::async_trait;
use sprocket_core::{Attachment, CollectionLink, Document, ManualClock, ResourceId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct FaultPlan {
    failing_commits: usize,
    failing_documents: HashSet<ResourceId>,
    stalls: HashMap<ResourceId, Duration>,
    calls: u64,
    faults_injected: u64,
}

/// Store wrapper with simulated latency and fault injection
#[derive(Debug)]
pub struct SimulatedStore {
    inner: SharedStore,
    clock: Arc<ManualClock>,
    latency: Duration,
    plan: RwLock<FaultPlan>,
}

impl SimulatedStore {
    /// Wrap a store; calls cost nothing until a latency is set
    #[must_use]
    pub fn new(inner: SharedStore, clock: Arc<ManualClock>) -> Self {
        Self {
            inner,
            clock,
            latency: Duration::ZERO,
            plan: RwLock::new(FaultPlan::default()),
        }
    }

    /// Charge this much clock time to every call
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `count` commits with a backend error
    pub async fn fail_next_commits(&self, count: usize) {
        self.plan.write().await.failing_commits = count;
    }

    /// Fail every read or commit that touches this document
    pub async fn fail_document(&self, id: ResourceId) {
        self.plan.write().await.failing_documents.insert(id);
    }

    /// Charge extra clock time to any call touching this document
    pub async fn stall_document(&self, id: ResourceId, extra: Duration) {
        self.plan.write().await.stalls.insert(id, extra);
    }

    /// Remove all injected faults
    pub async fn heal(&self) {
        let mut plan = self.plan.write().await;
        plan.failing_commits = 0;
        plan.failing_documents.clear();
        plan.stalls.clear();
    }

    /// Calls made so far
    pub async fn calls(&self) -> u64 {
        self.plan.read().await.calls
    }

    /// Faults injected so far
    pub async fn faults_injected(&self) -> u64 {
        self.plan.read().await.faults_injected
    }

    /// Charge latency and check the fault plan for the touched documents
    async fn enter<'a>(
        &self,
        touched: impl IntoIterator<Item = &'a ResourceId>,
    ) -> Result<(), StoreError> {
        let mut plan = self.plan.write().await;
        plan.calls += 1;
        let mut cost = self.latency;
        let mut failing = None;
        for id in touched {
            if let Some(extra) = plan.stalls.get(id) {
                cost += *extra;
            }
            if failing.is_none() && plan.failing_documents.contains(id) {
                failing = Some(id.clone());
            }
        }
        self.clock.advance(cost);

        if let Some(id) = failing {
            plan.faults_injected += 1;
            tracing::debug!(%id, "injected document fault");
            return Err(StoreError::backend(format!("injected fault on {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SimulatedStore {
    async fn get_document(
        &self,
        collection: &CollectionLink,
        id: &ResourceId,
    ) -> Result<Option<Document>, StoreError> {
        self.enter([id]).await?;
        self.inner.get_document(collection, id).await
    }

    async fn scan_documents(
        &self,
        collection: &CollectionLink,
        after: Option<&ResourceId>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        self.enter(std::iter::empty()).await?;
        self.inner.scan_documents(collection, after, limit).await
    }

    async fn get_attachment(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
        id: &ResourceId,
    ) -> Result<Option<Attachment>, StoreError> {
        self.enter([document]).await?;
        self.inner.get_attachment(collection, document, id).await
    }

    async fn list_attachments(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
    ) -> Result<Vec<Attachment>, StoreError> {
        self.enter([document]).await?;
        self.inner.list_attachments(collection, document).await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        self.enter(batch.iter().map(|write| write.key.id())).await?;
        {
            let mut plan = self.plan.write().await;
            if plan.failing_commits > 0 {
                plan.failing_commits -= 1;
                plan.faults_injected += 1;
                tracing::debug!(writes = batch.len(), "injected commit fault");
                return Err(StoreError::backend("injected commit fault"));
            }
        }
        self.inner.commit(batch).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.inner.stats().await
    }
}
