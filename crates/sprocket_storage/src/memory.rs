//! In-memory document store.

use crate::batch::{Resource, ResourceKey, WriteBatch};
use crate::store::{CommitReceipt, DocumentStore, StoreError, StoreStats};
use async_trait::async_trait;
use sprocket_core::{Attachment, CollectionLink, Document, ResourceId};
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::RwLock;

type AttachmentMap = BTreeMap<ResourceId, Attachment>;

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<CollectionLink, BTreeMap<ResourceId, Document>>,
    attachments: BTreeMap<(CollectionLink, ResourceId), AttachmentMap>,
    commits: u64,
    conflicts: u64,
}

impl MemoryState {
    fn get(&self, key: &ResourceKey) -> Option<Resource> {
        match key {
            ResourceKey::Document { collection, id } => self
                .documents
                .get(collection)
                .and_then(|docs| docs.get(id))
                .cloned()
                .map(Resource::Document),
            ResourceKey::Attachment {
                collection,
                document,
                id,
            } => self
                .attachments
                .get(&(collection.clone(), document.clone()))
                .and_then(|atts| atts.get(id))
                .cloned()
                .map(Resource::Attachment),
        }
    }

    fn apply(&mut self, key: ResourceKey, value: Option<Resource>) {
        match (key, value) {
            (ResourceKey::Document { collection, id }, Some(Resource::Document(doc))) => {
                self.documents.entry(collection).or_default().insert(id, doc);
            }
            (ResourceKey::Document { collection, id }, None) => {
                if let Some(docs) = self.documents.get_mut(&collection) {
                    docs.remove(&id);
                }
                // attachments never outlive their document
                self.attachments.remove(&(collection, id));
            }
            (
                ResourceKey::Attachment {
                    collection,
                    document,
                    id,
                },
                Some(Resource::Attachment(att)),
            ) => {
                self.attachments
                    .entry((collection, document))
                    .or_default()
                    .insert(id, att);
            }
            (
                ResourceKey::Attachment {
                    collection,
                    document,
                    id,
                },
                None,
            ) => {
                let parent = (collection, document);
                if let Some(atts) = self.attachments.get_mut(&parent) {
                    atts.remove(&id);
                    if atts.is_empty() {
                        self.attachments.remove(&parent);
                    }
                }
            }
            (key, Some(_)) => {
                tracing::warn!(%key, "ignoring write with mismatched resource kind");
            }
        }
    }
}

/// In-memory store.
///
/// State lives behind a single async `RwLock`; a commit holds the write lock
/// for validation and application, so batches are atomic and serialized.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub async fn count(&self, collection: &CollectionLink) -> usize {
        self.state
            .read()
            .await
            .documents
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Every document of a collection, in id order
    pub async fn documents(&self, collection: &CollectionLink) -> Vec<Document> {
        self.state
            .read()
            .await
            .documents
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove everything
    pub async fn clear(&self) {
        *self.state.write().await = MemoryState::default();
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(
        &self,
        collection: &CollectionLink,
        id: &ResourceId,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .documents
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn scan_documents(
        &self,
        collection: &CollectionLink,
        after: Option<&ResourceId>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let state = self.state.read().await;
        let Some(docs) = state.documents.get(collection) else {
            return Ok(Vec::new());
        };
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        Ok(docs
            .range::<ResourceId, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn get_attachment(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
        id: &ResourceId,
    ) -> Result<Option<Attachment>, StoreError> {
        let key = ResourceKey::attachment(collection, document, id);
        Ok(match self.state.read().await.get(&key) {
            Some(Resource::Attachment(att)) => Some(att),
            _ => None,
        })
    }

    async fn list_attachments(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
    ) -> Result<Vec<Attachment>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .attachments
            .get(&(collection.clone(), document.clone()))
            .map(|atts| atts.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        let mut state = self.state.write().await;

        for write in batch.iter() {
            let current = state.get(&write.key);
            if !write.precondition.holds(current.as_ref()) {
                state.conflicts += 1;
                return Err(StoreError::Conflict {
                    key: write.key.storage_key(),
                });
            }
        }

        let writes = batch.len();
        for write in batch {
            state.apply(write.key, write.value);
        }
        state.commits += 1;
        Ok(CommitReceipt { writes })
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state.read().await;
        Ok(StoreStats {
            document_count: state.documents.values().map(BTreeMap::len).sum(),
            attachment_count: state.attachments.values().map(BTreeMap::len).sum(),
            commits: state.commits,
            conflicts: state.conflicts,
        })
    }
}
