//! SPROCKET Core Types
//!
//! Pure types shared by the storage layer and the script runtime.
//! Nothing in this crate performs I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod document;
pub mod error;
pub mod id;
pub mod options;
pub mod query;
pub mod time;

// Re-exports
pub use document::{Attachment, CollectionLink, Document, Etag, ResourceId};
pub use error::{CoreError, CoreResult};
pub use id::{InvocationId, OperationId};
pub use options::{
    ContinuationToken, CreateOptions, DeleteOptions, FeedOptions, ReadOptions, ReplaceOptions,
};
pub use query::Query;
pub use time::{Clock, ManualClock, MonotonicClock, SharedClock, Timestamp};
