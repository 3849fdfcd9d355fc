//! Typed document filters used by `query_documents`.
//!
//! There is no query language; scripts build filters directly.

use crate::document::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Document filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Query {
    /// Every document
    All,
    /// Property at `path` equals `value`
    Eq {
        /// Dotted property path
        path: String,
        /// Expected value
        value: Value,
    },
    /// Property at `path` is present
    Exists {
        /// Dotted property path
        path: String,
    },
    /// Inner filter does not match
    Not {
        /// Negated filter
        inner: Box<Query>,
    },
    /// Every inner filter matches
    And {
        /// Conjuncts
        all: Vec<Query>,
    },
}

impl Query {
    /// Match every document
    #[must_use]
    pub const fn all() -> Self {
        Self::All
    }

    /// Match documents whose property equals a value
    #[must_use]
    pub fn equals(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Match documents that carry a property
    #[must_use]
    pub fn exists(path: impl Into<String>) -> Self {
        Self::Exists { path: path.into() }
    }

    /// Negate a filter
    #[must_use]
    pub fn negate(inner: Query) -> Self {
        Self::Not {
            inner: Box::new(inner),
        }
    }

    /// Conjunction with another filter
    #[must_use]
    pub fn and(self, other: Query) -> Self {
        match self {
            Self::All => other,
            Self::And { mut all } => {
                all.push(other);
                Self::And { all }
            }
            first => Self::And {
                all: vec![first, other],
            },
        }
    }

    /// Evaluate against a document
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Eq { path, value } => doc.get(path) == Some(value),
            Self::Exists { path } => doc.get(path).is_some(),
            Self::Not { inner } => !inner.matches(doc),
            Self::And { all } => all.iter().all(|q| q.matches(doc)),
        }
    }
}

impl Default for Query {
    fn default() -> Self {
        Self::All
    }
}
