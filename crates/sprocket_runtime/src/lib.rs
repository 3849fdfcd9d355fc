//! SPROCKET Runtime
//!
//! Deadline-bounded, all-or-nothing execution of server-side scripts.
//!
//! A script submits operations through an admission gate that compares the
//! remaining budget with the projected cost of everything still pending.
//! Accepted operations run against a staged view of the store and report
//! back through completion callbacks. The invocation commits when the script
//! has nothing left in flight, and rolls back if the budget runs out or a
//! callback raises.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod context;
pub mod deadline;
pub mod host;
pub mod monitor;
pub mod procedures;
pub mod queue;
pub mod registry;
pub mod script;
pub mod transaction;

// Re-exports
pub use admission::{AdmissionConfig, AdmissionDecision, AdmissionGate, RejectReason};
pub use context::{Collection, Context, Request, Response};
pub use deadline::{DeadlineMonitor, DEFAULT_BUDGET};
pub use host::{HostConfig, HostError, InvocationOutcome, ScriptHost};
pub use monitor::{InvocationMetrics, InvocationRecorder, JournalEvent};
pub use procedures::{BulkDelete, BulkImport, DeleteProgress, BULK_DELETE, BULK_IMPORT};
pub use queue::{
    CallbackTag, Completion, CompletionOrder, Operation, OperationError, OperationKind,
    OperationOutput, OperationQueue, OperationRequest,
};
pub use registry::{RegistryError, ScriptFactory, ScriptRegistry};
pub use script::{Script, ScriptError};
pub use transaction::{AbortReason, TransactionBoundary, TransactionState};
