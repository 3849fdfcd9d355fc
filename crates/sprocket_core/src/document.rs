//! Documents, attachments, resource ids and etags.

use crate::error::{CoreError, CoreResult};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Property holding the document id
pub const ID_PROPERTY: &str = "id";
/// System property holding the etag
pub const ETAG_PROPERTY: &str = "_etag";
/// System property holding the last-write timestamp
pub const TS_PROPERTY: &str = "_ts";

/// Longest id accepted for documents and attachments
pub const MAX_ID_LEN: usize = 255;

const FORBIDDEN_ID_CHARS: [char; 4] = ['/', '\\', '?', '#'];

/// Validated id of a document or attachment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId(String);

impl ResourceId {
    /// Validate and wrap an id
    ///
    /// # Errors
    ///
    /// Returns error if the id is empty, too long, has surrounding
    /// whitespace, or contains `/`, `\`, `?` or `#`
    pub fn parse(id: impl Into<String>) -> CoreResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(CoreError::InvalidId {
                reason: "id is empty".to_string(),
            });
        }
        if id.len() > MAX_ID_LEN {
            return Err(CoreError::InvalidId {
                reason: format!("id longer than {} bytes", MAX_ID_LEN),
            });
        }
        if id.trim() != id {
            return Err(CoreError::InvalidId {
                reason: "id has leading or trailing whitespace".to_string(),
            });
        }
        if let Some(c) = id.chars().find(|c| FORBIDDEN_ID_CHARS.contains(c)) {
            return Err(CoreError::InvalidId {
                reason: format!("id contains forbidden character {:?}", c),
            });
        }
        Ok(Self(id))
    }

    /// Generate a fresh random id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow as str
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ResourceId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        id.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a document collection.
///
/// Accepts either a bare name (`orders`) or a self link ending in
/// `colls/<name>`; only the name is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionLink(ResourceId);

impl CollectionLink {
    /// Parse a collection name or self link
    ///
    /// # Errors
    ///
    /// Returns error if the name is not a valid resource id
    pub fn parse(link: &str) -> CoreResult<Self> {
        let trimmed = link.trim_end_matches('/');
        let name = match trimmed.rsplit_once("colls/") {
            Some((_, name)) => name,
            None => trimmed,
        };
        Ok(Self(ResourceId::parse(name)?))
    }

    /// Collection name
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for CollectionLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "colls/{}", self.0)
    }
}

/// Opaque version tag of a stored resource.
///
/// Each write derives the next etag from the previous one and the new
/// content, so rewriting identical content still changes the etag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Etag(String);

impl Etag {
    /// Derive the etag for a write
    #[must_use]
    pub fn next(previous: Option<&Etag>, content: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        if let Some(prev) = previous {
            hasher.update(prev.0.as_bytes());
        }
        hasher.update(&[0u8]);
        hasher.update(content);
        let hash = hasher.finalize();
        Self(format!("\"{}\"", hex::encode(&hash.as_bytes()[..16])))
    }

    /// Wrap an etag received from a caller
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow as str
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A JSON document.
///
/// The body is always an object. `_etag` and `_ts` are owned by the store
/// and overwritten on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Document {
    body: Map<String, Value>,
}

impl Document {
    /// Wrap a JSON value
    ///
    /// # Errors
    ///
    /// Returns error if the value is not an object, or `id` is present but
    /// not a valid id string
    pub fn from_value(value: Value) -> CoreResult<Self> {
        let Value::Object(body) = value else {
            return Err(CoreError::InvalidDocument {
                reason: "document body must be a JSON object".to_string(),
            });
        };
        match body.get(ID_PROPERTY) {
            None => {}
            Some(Value::String(id)) => {
                ResourceId::parse(id.clone())?;
            }
            Some(_) => {
                return Err(CoreError::InvalidDocument {
                    reason: "id must be a string".to_string(),
                });
            }
        }
        Ok(Self { body })
    }

    /// Document id, if one is set
    #[must_use]
    pub fn id(&self) -> Option<ResourceId> {
        match self.body.get(ID_PROPERTY) {
            Some(Value::String(id)) => ResourceId::parse(id.clone()).ok(),
            _ => None,
        }
    }

    /// Return the id, generating one if allowed
    ///
    /// # Errors
    ///
    /// Returns error if the id is missing and generation is disabled
    pub fn ensure_id(&mut self, generate: bool) -> CoreResult<ResourceId> {
        if let Some(id) = self.id() {
            return Ok(id);
        }
        if !generate {
            return Err(CoreError::InvalidDocument {
                reason: "document has no id and automatic id generation is disabled".to_string(),
            });
        }
        let id = ResourceId::generate();
        self.body
            .insert(ID_PROPERTY.to_string(), Value::String(id.as_str().to_string()));
        Ok(id)
    }

    /// Force the id property
    pub fn set_id(&mut self, id: &ResourceId) {
        self.body
            .insert(ID_PROPERTY.to_string(), Value::String(id.as_str().to_string()));
    }

    /// Stored etag
    #[must_use]
    pub fn etag(&self) -> Option<Etag> {
        self.body
            .get(ETAG_PROPERTY)
            .and_then(Value::as_str)
            .map(Etag::from_raw)
    }

    /// Stored last-write timestamp
    #[must_use]
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.body
            .get(TS_PROPERTY)
            .and_then(Value::as_i64)
            .map(Timestamp::from_secs)
    }

    /// Set system properties for a write
    pub fn stamp(&mut self, etag: &Etag, ts: Timestamp) {
        self.body.insert(
            ETAG_PROPERTY.to_string(),
            Value::String(etag.as_str().to_string()),
        );
        self.body
            .insert(TS_PROPERTY.to_string(), Value::from(ts.as_secs()));
    }

    /// Canonical bytes of the user-visible content (system properties excluded).
    ///
    /// `serde_json::Map` keeps keys sorted, so the encoding is stable.
    #[must_use]
    pub fn content_bytes(&self) -> Vec<u8> {
        let user: Map<String, Value> = self
            .body
            .iter()
            .filter(|(k, _)| k.as_str() != ETAG_PROPERTY && k.as_str() != TS_PROPERTY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        serde_json::to_vec(&user).unwrap_or_default()
    }

    /// Size of the encoded document in bytes
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(&self.body).map(|b| b.len()).unwrap_or(0)
    }

    /// Look up a property by dotted path (`address.city`)
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.body.get(first)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Borrow the body
    #[must_use]
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Convert into a JSON value
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }

    /// Copy out as a JSON value
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

impl TryFrom<Value> for Document {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        doc.into_value()
    }
}

/// Attachment metadata, stored as a child of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Attachment id, unique within the parent document
    pub id: ResourceId,
    /// MIME type of the referenced media
    pub content_type: String,
    /// Link to the media
    pub media: String,
    /// Etag, set by the store
    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<Etag>,
    /// Last-write time, set by the store
    #[serde(rename = "_ts", default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Timestamp>,
}

impl Attachment {
    /// Create attachment metadata
    #[must_use]
    pub fn new(id: ResourceId, content_type: impl Into<String>, media: impl Into<String>) -> Self {
        Self {
            id,
            content_type: content_type.into(),
            media: media.into(),
            etag: None,
            ts: None,
        }
    }

    /// Canonical bytes used for etag derivation
    #[must_use]
    pub fn content_bytes(&self) -> Vec<u8> {
        format!("{}\0{}\0{}", self.id, self.content_type, self.media).into_bytes()
    }
}
