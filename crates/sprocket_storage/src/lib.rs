//! SPROCKET Storage
//!
//! Document stores and the per-invocation staging overlay.
//! Stores only ever change through [`DocumentStore::commit`], which applies
//! a [`WriteBatch`] atomically or not at all.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod durable;
pub mod memory;
pub mod sim;
pub mod staging;
pub mod store;

pub use batch::{Precondition, Resource, ResourceKey, StagedWrite, WriteBatch};
pub use durable::RedbStore;
pub use memory::MemoryStore;
pub use sim::SimulatedStore;
pub use staging::{Page, StagedView};
pub use store::{CommitReceipt, DocumentStore, SharedStore, StoreConfig, StoreError, StoreStats};
