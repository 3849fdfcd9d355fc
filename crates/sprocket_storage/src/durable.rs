//! Durable document store on redb.
//!
//! Two tables hold JSON-encoded records under flat keys:
//!
//! | table         | key                          | value              |
//! |---------------|------------------------------|--------------------|
//! | `documents`   | `<collection>/<id>`          | document body      |
//! | `attachments` | `<collection>/<doc>/<id>`    | attachment record  |
//!
//! Ids never contain `/`, so every key of a collection sorts between
//! `<collection>/` and `<collection>0`. redb work is synchronous and runs on
//! the blocking pool.

use crate::batch::{Resource, ResourceKey, StagedWrite, WriteBatch};
use crate::store::{CommitReceipt, DocumentStore, StoreError, StoreStats};
use async_trait::async_trait;
use redb::{
    Database, ReadableTable, ReadableTableMetadata, Table, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use sprocket_core::{Attachment, CollectionLink, Document, ResourceId};
use std::fmt;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const ATTACHMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("attachments");

/// redb-backed store
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
    commits: AtomicU64,
    conflicts: AtomicU64,
}

impl fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedbStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a database file
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the file cannot be opened or the
    /// tables cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(StoreError::backend)?;

        let txn = db.begin_write().map_err(StoreError::backend)?;
        txn.open_table(DOCUMENTS).map_err(StoreError::backend)?;
        txn.open_table(ATTACHMENTS).map_err(StoreError::backend)?;
        txn.commit().map_err(StoreError::backend)?;

        tracing::debug!(path = %path.display(), "opened redb store");
        Ok(Self {
            db: Arc::new(db),
            path,
            commits: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        })
    }

    /// Database file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(StoreError::backend)?
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::Corrupt {
        key: key.to_string(),
        reason: err.to_string(),
    })
}

fn encode(resource: &Resource) -> Result<Vec<u8>, StoreError> {
    match resource {
        Resource::Document(doc) => serde_json::to_vec(doc),
        Resource::Attachment(att) => serde_json::to_vec(att),
    }
    .map_err(StoreError::backend)
}

fn collection_bounds(
    collection: &CollectionLink,
    after: Option<&ResourceId>,
) -> (Bound<String>, Bound<String>) {
    let name = collection.name();
    let start = match after {
        Some(id) => Bound::Excluded(format!("{name}/{id}")),
        None => Bound::Included(format!("{name}/")),
    };
    (start, Bound::Excluded(format!("{name}0")))
}

type RecordTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

fn current(
    documents: &RecordTable<'_>,
    attachments: &RecordTable<'_>,
    key: &ResourceKey,
) -> Result<Option<Resource>, StoreError> {
    let flat = key.storage_key();
    match key {
        ResourceKey::Document { .. } => documents
            .get(flat.as_str())
            .map_err(StoreError::backend)?
            .map(|guard| decode::<Document>(&flat, guard.value()).map(Resource::Document))
            .transpose(),
        ResourceKey::Attachment { .. } => attachments
            .get(flat.as_str())
            .map_err(StoreError::backend)?
            .map(|guard| decode::<Attachment>(&flat, guard.value()).map(Resource::Attachment))
            .transpose(),
    }
}

fn remove_attachments_of(
    attachments: &mut RecordTable<'_>,
    document_key: &str,
) -> Result<(), StoreError> {
    let start = format!("{document_key}/");
    let end = format!("{document_key}0");
    let doomed = attachments
        .range::<&str>(start.as_str()..end.as_str())
        .map_err(StoreError::backend)?
        .map(|entry| entry.map(|(key, _)| key.value().to_string()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::backend)?;
    for key in doomed {
        attachments.remove(key.as_str()).map_err(StoreError::backend)?;
    }
    Ok(())
}

fn apply<'txn>(
    documents: &mut RecordTable<'txn>,
    attachments: &mut RecordTable<'txn>,
    write: StagedWrite,
) -> Result<(), StoreError> {
    let flat = write.key.storage_key();
    let table = match write.key {
        ResourceKey::Document { .. } => &mut *documents,
        ResourceKey::Attachment { .. } => &mut *attachments,
    };
    match write.value {
        Some(value) => {
            let bytes = encode(&value)?;
            table
                .insert(flat.as_str(), bytes.as_slice())
                .map_err(StoreError::backend)?;
        }
        None => {
            table.remove(flat.as_str()).map_err(StoreError::backend)?;
            if matches!(write.key, ResourceKey::Document { .. }) {
                remove_attachments_of(attachments, &flat)?;
            }
        }
    }
    Ok(())
}

/// Validate every precondition, then apply every write
fn validate_and_apply(txn: &WriteTransaction, batch: WriteBatch) -> Result<usize, StoreError> {
    let mut documents = txn.open_table(DOCUMENTS).map_err(StoreError::backend)?;
    let mut attachments = txn.open_table(ATTACHMENTS).map_err(StoreError::backend)?;

    for write in batch.iter() {
        let found = current(&documents, &attachments, &write.key)?;
        if !write.precondition.holds(found.as_ref()) {
            return Err(StoreError::Conflict {
                key: write.key.storage_key(),
            });
        }
    }

    let writes = batch.len();
    for write in batch {
        apply(&mut documents, &mut attachments, write)?;
    }
    Ok(writes)
}

fn commit_batch(db: &Database, batch: WriteBatch) -> Result<usize, StoreError> {
    let txn = db.begin_write().map_err(StoreError::backend)?;
    match validate_and_apply(&txn, batch) {
        Ok(writes) => {
            txn.commit().map_err(StoreError::backend)?;
            Ok(writes)
        }
        Err(err) => {
            if let Err(abort) = txn.abort() {
                tracing::warn!(error = %abort, "failed to abort redb transaction");
            }
            Err(err)
        }
    }
}

#[async_trait]
impl DocumentStore for RedbStore {
    async fn get_document(
        &self,
        collection: &CollectionLink,
        id: &ResourceId,
    ) -> Result<Option<Document>, StoreError> {
        let key = ResourceKey::document(collection, id).storage_key();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(StoreError::backend)?;
            let table = txn.open_table(DOCUMENTS).map_err(StoreError::backend)?;
            table
                .get(key.as_str())
                .map_err(StoreError::backend)?
                .map(|guard| decode::<Document>(&key, guard.value()))
                .transpose()
        })
        .await
    }

    async fn scan_documents(
        &self,
        collection: &CollectionLink,
        after: Option<&ResourceId>,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let (start, end) = collection_bounds(collection, after);
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(StoreError::backend)?;
            let table = txn.open_table(DOCUMENTS).map_err(StoreError::backend)?;
            let range = table
                .range::<&str>((
                    start.as_ref().map(String::as_str),
                    end.as_ref().map(String::as_str),
                ))
                .map_err(StoreError::backend)?;

            let mut out: Vec<Document> = Vec::new();
            for entry in range.take(limit) {
                let (key, value) = entry.map_err(StoreError::backend)?;
                out.push(decode(key.value(), value.value())?);
            }
            Ok(out)
        })
        .await
    }

    async fn get_attachment(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
        id: &ResourceId,
    ) -> Result<Option<Attachment>, StoreError> {
        let key = ResourceKey::attachment(collection, document, id).storage_key();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(StoreError::backend)?;
            let table = txn.open_table(ATTACHMENTS).map_err(StoreError::backend)?;
            table
                .get(key.as_str())
                .map_err(StoreError::backend)?
                .map(|guard| decode::<Attachment>(&key, guard.value()))
                .transpose()
        })
        .await
    }

    async fn list_attachments(
        &self,
        collection: &CollectionLink,
        document: &ResourceId,
    ) -> Result<Vec<Attachment>, StoreError> {
        let parent = ResourceKey::document(collection, document).storage_key();
        self.blocking(move |db| {
            let start = format!("{parent}/");
            let end = format!("{parent}0");
            let txn = db.begin_read().map_err(StoreError::backend)?;
            let table = txn.open_table(ATTACHMENTS).map_err(StoreError::backend)?;

            let mut out: Vec<Attachment> = Vec::new();
            for entry in table
                .range::<&str>(start.as_str()..end.as_str())
                .map_err(StoreError::backend)?
            {
                let (key, value) = entry.map_err(StoreError::backend)?;
                out.push(decode(key.value(), value.value())?);
            }
            Ok(out)
        })
        .await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StoreError> {
        match self.blocking(move |db| commit_batch(db, batch)).await {
            Ok(writes) => {
                self.commits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(writes, "redb commit");
                Ok(CommitReceipt { writes })
            }
            Err(err) => {
                if matches!(err, StoreError::Conflict { .. }) {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let (document_count, attachment_count) = self
            .blocking(|db| {
                let txn = db.begin_read().map_err(StoreError::backend)?;
                let documents = txn.open_table(DOCUMENTS).map_err(StoreError::backend)?;
                let attachments = txn.open_table(ATTACHMENTS).map_err(StoreError::backend)?;
                let docs = documents.len().map_err(StoreError::backend)?;
                let atts = attachments.len().map_err(StoreError::backend)?;
                Ok((docs as usize, atts as usize))
            })
            .await?;

        Ok(StoreStats {
            document_count,
            attachment_count,
            commits: self.commits.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        })
    }
}
