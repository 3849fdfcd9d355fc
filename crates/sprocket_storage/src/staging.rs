//! Per-invocation staging overlay.
//!
//! A [`StagedView`] is the only path through which a running invocation
//! touches the store. Reads fall through to committed state the first time a
//! key is seen and are cached after that; writes land in the overlay. Each
//! key remembers the state it had when first touched, and
//! [`StagedView::commit`] hands the store a batch whose preconditions are
//! exactly those observations. Dropping the view discards every staged write.

use crate::batch::{Precondition, Resource, ResourceKey, StagedWrite, WriteBatch};
use crate::store::{load, CommitReceipt, SharedStore, StoreConfig, StoreError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sprocket_core::{
    Attachment, CollectionLink, ContinuationToken, CoreError, CreateOptions, DeleteOptions,
    Document, Etag, FeedOptions, Query, ReadOptions, ReplaceOptions, ResourceId, Timestamp,
};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// One page of a feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    pub items: Vec<T>,
    /// Token for the next page, `None` on the last page
    pub continuation: Option<ContinuationToken>,
}

impl<T> Page<T> {
    /// Whether more pages follow
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.continuation.is_some()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    precondition: Precondition,
    value: Option<Resource>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct Overlay {
    entries: IndexMap<ResourceKey, Entry>,
}

impl Overlay {
    /// Record a write. Keys are always resolved before they are staged.
    fn stage(&mut self, key: ResourceKey, value: Option<Resource>) {
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            precondition: Precondition::Absent,
            value: None,
            dirty: false,
        });
        entry.value = value;
        entry.dirty = true;
    }

    /// Overlay documents of a collection with ids after `after`
    fn documents_in<'a>(
        &'a self,
        collection: &'a CollectionLink,
        after: Option<&'a ResourceId>,
    ) -> impl Iterator<Item = (&'a ResourceId, Option<&'a Document>)> + 'a {
        self.entries.iter().filter_map(move |(key, entry)| match key {
            ResourceKey::Document { collection: c, id }
                if c == collection && after.is_none_or(|a| id > a) =>
            {
                match &entry.value {
                    Some(Resource::Document(doc)) => Some((id, Some(doc))),
                    None => Some((id, None)),
                    Some(Resource::Attachment(_)) => None,
                }
            }
            _ => None,
        })
    }

    fn dirty_len(&self) -> usize {
        self.entries.values().filter(|e| e.dirty).count()
    }
}

fn attachment_not_found(id: &ResourceId) -> CoreError {
    CoreError::NotFound {
        kind: "Attachment".to_string(),
        id: id.to_string(),
    }
}

fn check_if_match(
    id: &ResourceId,
    expected: Option<&Etag>,
    current: &Document,
) -> Result<(), StoreError> {
    match expected {
        Some(expected) if current.etag().as_ref() != Some(expected) => {
            Err(CoreError::PreconditionFailed { id: id.to_string() }.into())
        }
        _ => Ok(()),
    }
}

fn into_document(resource: Option<Resource>) -> Option<Document> {
    match resource {
        Some(Resource::Document(doc)) => Some(doc),
        _ => None,
    }
}

fn into_attachment(resource: Option<Resource>) -> Option<Attachment> {
    match resource {
        Some(Resource::Attachment(att)) => Some(att),
        _ => None,
    }
}

/// Transactional view over a store
#[derive(Debug)]
pub struct StagedView {
    store: SharedStore,
    config: StoreConfig,
    overlay: Mutex<Overlay>,
}

impl StagedView {
    /// Open an empty overlay on a store
    #[must_use]
    pub fn new(store: SharedStore, config: StoreConfig) -> Self {
        Self {
            store,
            config,
            overlay: Mutex::new(Overlay::default()),
        }
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Number of staged writes
    pub async fn staged_len(&self) -> usize {
        self.overlay.lock().await.dirty_len()
    }

    /// Current value of a key, loading and remembering committed state on
    /// first touch
    async fn resolve(
        &self,
        overlay: &mut Overlay,
        key: &ResourceKey,
    ) -> Result<Option<Resource>, StoreError> {
        if let Some(entry) = overlay.entries.get(key) {
            return Ok(entry.value.clone());
        }
        let committed = load(self.store.as_ref(), key).await?;
        overlay.entries.insert(
            key.clone(),
            Entry {
                precondition: Precondition::observe(committed.as_ref()),
                value: committed.clone(),
                dirty: false,
            },
        );
        Ok(committed)
    }

    /// Load committed state for `key` without holding the overlay lock, so
    /// operations on different keys overlap their store reads. The first
    /// observation wins; the caller's [`StagedView::resolve`] then finds the
    /// key already present.
    async fn prefetch(&self, key: &ResourceKey) -> Result<(), StoreError> {
        if self.overlay.lock().await.entries.contains_key(key) {
            return Ok(());
        }
        let committed = load(self.store.as_ref(), key).await?;
        self.overlay
            .lock()
            .await
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry {
                precondition: Precondition::observe(committed.as_ref()),
                value: committed,
                dirty: false,
            });
        Ok(())
    }

    fn check_size(&self, doc: &Document) -> Result<(), StoreError> {
        let limit = self.config.max_document_size;
        if limit > 0 && doc.encoded_len() > limit {
            return Err(CoreError::CapacityExceeded {
                resource: "document size".to_string(),
                limit: limit as u64,
            }
            .into());
        }
        Ok(())
    }

    /// Create a document, or overwrite it when `upsert` is set
    ///
    /// # Errors
    ///
    /// Rejects a missing id when generation is disabled, an existing id
    /// without `upsert`, and documents over the size limit.
    pub async fn create_document(
        &self,
        collection: &CollectionLink,
        mut doc: Document,
        options: &CreateOptions,
    ) -> Result<Document, StoreError> {
        let id = doc.ensure_id(!options.disable_automatic_id_generation)?;
        let key = ResourceKey::document(collection, &id);
        self.prefetch(&key).await?;

        let mut overlay = self.overlay.lock().await;
        let current = into_document(self.resolve(&mut overlay, &key).await?);
        if current.is_some() && !options.upsert {
            return Err(CoreError::document_exists(id.as_str()).into());
        }

        let previous = current.as_ref().and_then(Document::etag);
        doc.stamp(
            &Etag::next(previous.as_ref(), &doc.content_bytes()),
            Timestamp::now(),
        );
        self.check_size(&doc)?;
        overlay.stage(key, Some(Resource::Document(doc.clone())));
        Ok(doc)
    }

    /// Replace an existing document
    ///
    /// # Errors
    ///
    /// Rejects a body whose id differs from `id`, a missing document, an
    /// `if_match` etag that is not current, and oversized documents.
    pub async fn replace_document(
        &self,
        collection: &CollectionLink,
        id: &ResourceId,
        mut doc: Document,
        options: &ReplaceOptions,
    ) -> Result<Document, StoreError> {
        match doc.id() {
            Some(body_id) if body_id != *id => {
                return Err(CoreError::Validation {
                    field: "id".to_string(),
                    reason: format!("body id {body_id} does not match {id}"),
                }
                .into());
            }
            Some(_) => {}
            None => doc.set_id(id),
        }
        let key = ResourceKey::document(collection, id);
        self.prefetch(&key).await?;

        let mut overlay = self.overlay.lock().await;
        let current = into_document(self.resolve(&mut overlay, &key).await?)
            .ok_or_else(|| CoreError::document_not_found(id.as_str()))?;
        check_if_match(id, options.if_match.as_ref(), &current)?;

        doc.stamp(
            &Etag::next(current.etag().as_ref(), &doc.content_bytes()),
            Timestamp::now(),
        );
        self.check_size(&doc)?;
        overlay.stage(key, Some(Resource::Document(doc.clone())));
        Ok(doc)
    }

    /// Delete a document and every attachment it owns
    ///
    /// # Errors
    ///
    /// Rejects a missing document and an `if_match` etag that is not current.
    pub async fn delete_document(
        &self,
        collection: &CollectionLink,
        id: &ResourceId,
        options: &DeleteOptions,
    ) -> Result<(), StoreError> {
        let key = ResourceKey::document(collection, id);

        let mut overlay = self.overlay.lock().await;
        let current = into_document(self.resolve(&mut overlay, &key).await?)
            .ok_or_else(|| CoreError::document_not_found(id.as_str()))?;
        check_if_match(id, options.if_match.as_ref(), &current)?;

        for att in self.attachments_of(&overlay, collection, id).await? {
            let att_key = ResourceKey::attachment(collection, id, &att.id);
            self.resolve(&mut overlay, &att_key).await?;
            overlay.stage(att_key, None);
        }
        overlay.stage(key, None);
        Ok(())
    }

    /// Read a document. `Ok(None)` means the caller's `if_none_match` etag
    /// is still current.
    ///
    /// # Errors
    ///
    /// Rejects a missing document.
    pub async fn read_document(
        &self,
        collection: &CollectionLink,
        id: &ResourceId,
        options: &ReadOptions,
    ) -> Result<Option<Document>, StoreError> {
        let key = ResourceKey::document(collection, id);
        self.prefetch(&key).await?;
        let mut overlay = self.overlay.lock().await;
        let current = into_document(self.resolve(&mut overlay, &key).await?)
            .ok_or_else(|| CoreError::document_not_found(id.as_str()))?;

        match &options.if_none_match {
            Some(etag) if current.etag().as_ref() == Some(etag) => Ok(None),
            _ => Ok(Some(current)),
        }
    }

    /// One page of the collection in id order
    ///
    /// # Errors
    ///
    /// Rejects a malformed continuation token.
    pub async fn read_documents(
        &self,
        collection: &CollectionLink,
        options: &FeedOptions,
    ) -> Result<Page<Document>, StoreError> {
        let page_size = options.effective_page_size();
        let after = options.resume_after()?;

        let overlay = self.overlay.lock().await;
        let mut items = self
            .merged_scan(&overlay, collection, after.as_ref(), page_size + 1)
            .await?;

        let continuation = if items.len() > page_size {
            items.truncate(page_size);
            items.last().and_then(Document::id).map(|id| ContinuationToken::after(&id))
        } else {
            None
        };
        Ok(Page {
            items,
            continuation,
        })
    }

    /// One page of the documents matching `query`, in id order
    ///
    /// # Errors
    ///
    /// Rejects a malformed continuation token.
    pub async fn query_documents(
        &self,
        collection: &CollectionLink,
        query: &Query,
        options: &FeedOptions,
    ) -> Result<Page<Document>, StoreError> {
        let page_size = options.effective_page_size();
        let mut cursor = options.resume_after()?;
        let mut items = Vec::new();

        let overlay = self.overlay.lock().await;
        loop {
            let batch = self
                .merged_scan(&overlay, collection, cursor.as_ref(), page_size + 1)
                .await?;
            let more = batch.len() > page_size;
            let examined = &batch[..batch.len().min(page_size)];

            for (idx, doc) in examined.iter().enumerate() {
                if !query.matches(doc) {
                    continue;
                }
                items.push(doc.clone());
                if items.len() == page_size {
                    let continuation = if idx + 1 < batch.len() {
                        doc.id().map(|id| ContinuationToken::after(&id))
                    } else {
                        None
                    };
                    return Ok(Page {
                        items,
                        continuation,
                    });
                }
            }

            if !more {
                return Ok(Page {
                    items,
                    continuation: None,
                });
            }
            cursor = examined.last().and_then(Document::id);
        }
    }

    /// First `count` documents after `after`, committed state merged with
    /// the overlay.
    ///
    /// The backend is asked for `count` plus one row per overlay entry in
    /// range, so even if every staged delete hits a fetched row at least
    /// `count` fetched rows survive and no unfetched row can sort earlier.
    async fn merged_scan(
        &self,
        overlay: &Overlay,
        collection: &CollectionLink,
        after: Option<&ResourceId>,
        count: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let staged: Vec<_> = overlay.documents_in(collection, after).collect();
        let limit = count + staged.len();
        let fetched = self.store.scan_documents(collection, after, limit).await?;

        let mut merged: BTreeMap<ResourceId, Document> = fetched
            .into_iter()
            .filter_map(|doc| doc.id().map(|id| (id, doc)))
            .collect();
        for (id, value) in staged {
            match value {
                Some(doc) => {
                    merged.insert(id.clone(), doc.clone());
                }
                None => {
                    merged.remove(id);
                }
            }
        }
        Ok(merged.into_values().take(count).collect())
    }

    /// Attachments of a document, committed state merged with the overlay
    async fn attachments_of(
        &self,
        overlay: &Overlay,
        collection: &CollectionLink,
        document: &ResourceId,
    ) -> Result<Vec<Attachment>, StoreError> {
        let mut merged: BTreeMap<ResourceId, Attachment> = self
            .store
            .list_attachments(collection, document)
            .await?
            .into_iter()
            .map(|att| (att.id.clone(), att))
            .collect();

        for (key, entry) in &overlay.entries {
            let ResourceKey::Attachment {
                collection: c,
                document: d,
                id,
            } = key
            else {
                continue;
            };
            if c != collection || d != document {
                continue;
            }
            match &entry.value {
                Some(Resource::Attachment(att)) => {
                    merged.insert(id.clone(), att.clone());
                }
                _ => {
                    merged.remove(id);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Attach media metadata to an existing document
    ///
    /// # Errors
    ///
    /// Rejects a missing parent, a duplicate attachment id, and a parent
    /// already holding the maximum number of attachments.
    pub async fn create_attachment(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
        mut attachment: Attachment,
    ) -> Result<Attachment, StoreError> {
        let mut overlay = self.overlay.lock().await;
        let parent = ResourceKey::document(collection, document);
        if into_document(self.resolve(&mut overlay, &parent).await?).is_none() {
            return Err(CoreError::document_not_found(document.as_str()).into());
        }

        let key = ResourceKey::attachment(collection, document, &attachment.id);
        if self.resolve(&mut overlay, &key).await?.is_some() {
            return Err(CoreError::AlreadyExists {
                kind: "Attachment".to_string(),
                id: attachment.id.to_string(),
            }
            .into());
        }

        let limit = self.config.max_attachments;
        if limit > 0
            && self
                .attachments_of(&overlay, collection, document)
                .await?
                .len()
                >= limit
        {
            return Err(CoreError::CapacityExceeded {
                resource: "attachments per document".to_string(),
                limit: limit as u64,
            }
            .into());
        }

        attachment.etag = Some(Etag::next(None, &attachment.content_bytes()));
        attachment.ts = Some(Timestamp::now());
        overlay.stage(key, Some(Resource::Attachment(attachment.clone())));
        Ok(attachment)
    }

    /// Read one attachment
    ///
    /// # Errors
    ///
    /// Rejects a missing attachment.
    pub async fn read_attachment(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
        id: &ResourceId,
    ) -> Result<Attachment, StoreError> {
        let key = ResourceKey::attachment(collection, document, id);
        self.prefetch(&key).await?;
        let mut overlay = self.overlay.lock().await;
        into_attachment(self.resolve(&mut overlay, &key).await?)
            .ok_or_else(|| attachment_not_found(id).into())
    }

    /// Delete one attachment
    ///
    /// # Errors
    ///
    /// Rejects a missing attachment.
    pub async fn delete_attachment(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
        id: &ResourceId,
    ) -> Result<(), StoreError> {
        let key = ResourceKey::attachment(collection, document, id);
        self.prefetch(&key).await?;
        let mut overlay = self.overlay.lock().await;
        if into_attachment(self.resolve(&mut overlay, &key).await?).is_none() {
            return Err(attachment_not_found(id).into());
        }
        overlay.stage(key, None);
        Ok(())
    }

    /// Drain the overlay into a batch of staged writes
    pub async fn take_batch(&self) -> WriteBatch {
        let overlay = std::mem::take(&mut *self.overlay.lock().await);
        overlay
            .entries
            .into_iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, entry)| StagedWrite {
                key,
                precondition: entry.precondition,
                value: entry.value,
            })
            .collect()
    }

    /// Apply every staged write atomically and empty the overlay
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if a touched resource changed since it
    /// was first read, or a backend error. Either way nothing is applied.
    pub async fn commit(&self) -> Result<CommitReceipt, StoreError> {
        let batch = self.take_batch().await;
        if batch.is_empty() {
            return Ok(CommitReceipt { writes: 0 });
        }
        self.store.commit(batch).await
    }

    /// Discard every staged write
    pub async fn discard(&self) -> usize {
        self.take_batch().await.len()
    }
}
