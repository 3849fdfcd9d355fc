//! Write batches handed to [`crate::DocumentStore::commit`].

use serde::{Deserialize, Serialize};
use sprocket_core::{Attachment, CollectionLink, Document, Etag, ResourceId};

/// Address of a stored resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKey {
    /// A document in a collection
    Document {
        /// Owning collection
        collection: CollectionLink,
        /// Document id
        id: ResourceId,
    },
    /// An attachment of a document
    Attachment {
        /// Owning collection
        collection: CollectionLink,
        /// Parent document id
        document: ResourceId,
        /// Attachment id
        id: ResourceId,
    },
}

impl ResourceKey {
    /// Key of a document
    #[must_use]
    pub fn document(collection: &CollectionLink, id: &ResourceId) -> Self {
        Self::Document {
            collection: collection.clone(),
            id: id.clone(),
        }
    }

    /// Key of an attachment
    #[must_use]
    pub fn attachment(collection: &CollectionLink, document: &ResourceId, id: &ResourceId) -> Self {
        Self::Attachment {
            collection: collection.clone(),
            document: document.clone(),
            id: id.clone(),
        }
    }

    /// Owning collection
    #[must_use]
    pub fn collection(&self) -> &CollectionLink {
        match self {
            Self::Document { collection, .. } | Self::Attachment { collection, .. } => collection,
        }
    }

    /// Flat key used by byte-keyed backends.
    ///
    /// Ids never contain `/`, so the encoding is unambiguous and all keys of
    /// one collection share the `<collection>/` prefix.
    #[must_use]
    pub fn storage_key(&self) -> String {
        match self {
            Self::Document { collection, id } => format!("{}/{}", collection.name(), id),
            Self::Attachment {
                collection,
                document,
                id,
            } => format!("{}/{}/{}", collection.name(), document, id),
        }
    }

    /// Human readable resource kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Document { .. } => "Document",
            Self::Attachment { .. } => "Attachment",
        }
    }

    /// Id of the addressed resource
    #[must_use]
    pub fn id(&self) -> &ResourceId {
        match self {
            Self::Document { id, .. } | Self::Attachment { id, .. } => id,
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.storage_key())
    }
}

/// A stored resource value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    /// Document body
    Document(Document),
    /// Attachment metadata
    Attachment(Attachment),
}

impl Resource {
    /// Etag of the stored value
    #[must_use]
    pub fn etag(&self) -> Option<Etag> {
        match self {
            Self::Document(doc) => doc.etag(),
            Self::Attachment(att) => att.etag.clone(),
        }
    }

    /// Encoded size in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Document(doc) => doc.encoded_len(),
            Self::Attachment(att) => att.content_bytes().len(),
        }
    }
}

/// State a write expects to find when it is committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    /// Resource did not exist when the invocation first touched it
    Absent,
    /// Resource existed with this etag when the invocation first touched it
    Matches(Etag),
}

impl Precondition {
    /// Precondition capturing the currently stored value
    #[must_use]
    pub fn observe(current: Option<&Resource>) -> Self {
        match current.and_then(Resource::etag) {
            Some(etag) => Self::Matches(etag),
            None => Self::Absent,
        }
    }

    /// Check against the value found at commit time
    #[must_use]
    pub fn holds(&self, current: Option<&Resource>) -> bool {
        match (self, current) {
            (Self::Absent, None) => true,
            (Self::Matches(expected), Some(found)) => found.etag().as_ref() == Some(expected),
            _ => false,
        }
    }
}

/// One staged write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedWrite {
    /// Target resource
    pub key: ResourceKey,
    /// Expected state of the target at commit
    pub precondition: Precondition,
    /// New value, `None` to delete
    pub value: Option<Resource>,
}

/// Ordered set of writes applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    writes: Vec<StagedWrite>,
}

impl WriteBatch {
    /// Create an empty batch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a write
    pub fn push(&mut self, write: StagedWrite) {
        self.writes.push(write);
    }

    /// Number of writes
    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Whether the batch is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Iterate over writes in order
    pub fn iter(&self) -> impl Iterator<Item = &StagedWrite> {
        self.writes.iter()
    }
}

impl FromIterator<StagedWrite> for WriteBatch {
    fn from_iter<I: IntoIterator<Item = StagedWrite>>(iter: I) -> Self {
        Self {
            writes: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for WriteBatch {
    type Item = StagedWrite;
    type IntoIter = std::vec::IntoIter<StagedWrite>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn coll() -> CollectionLink {
        CollectionLink::parse("orders").unwrap()
    }

    fn id(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    #[test]
    fn test_storage_key_layout() {
        let doc = ResourceKey::document(&coll(), &id("a"));
        let att = ResourceKey::attachment(&coll(), &id("a"), &id("img"));
        assert_eq!(doc.storage_key(), "orders/a");
        assert_eq!(att.storage_key(), "orders/a/img");
        assert_eq!(att.kind(), "Attachment");
    }

    #[test]
    fn test_precondition_absent() {
        let pre = Precondition::observe(None);
        assert_eq!(pre, Precondition::Absent);
        assert!(pre.holds(None));

        let mut doc = Document::from_value(json!({"id": "a"})).unwrap();
        doc.stamp(&Etag::next(None, b"a"), sprocket_core::Timestamp::from_secs(1));
        assert!(!pre.holds(Some(&Resource::Document(doc))));
    }

    #[test]
    fn test_precondition_matches_etag() {
        let mut doc = Document::from_value(json!({"id": "a"})).unwrap();
        let etag = Etag::next(None, b"a");
        doc.stamp(&etag, sprocket_core::Timestamp::from_secs(1));
        let stored = Resource::Document(doc.clone());

        let pre = Precondition::observe(Some(&stored));
        assert_eq!(pre, Precondition::Matches(etag.clone()));
        assert!(pre.holds(Some(&stored)));
        assert!(!pre.holds(None));

        doc.stamp(&Etag::next(Some(&etag), b"a"), sprocket_core::Timestamp::from_secs(2));
        assert!(!pre.holds(Some(&Resource::Document(doc))));
    }

    #[test]
    fn test_batch_collects_in_order() {
        let batch: WriteBatch = ["a", "b"]
            .iter()
            .map(|s| StagedWrite {
                key: ResourceKey::document(&coll(), &id(s)),
                precondition: Precondition::Absent,
                value: None,
            })
            .collect();
        assert_eq!(batch.len(), 2);
        let keys: Vec<_> = batch.iter().map(|w| w.key.id().to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
