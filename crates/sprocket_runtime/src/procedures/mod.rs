//! Built-in stored procedures.

mod bulk_delete;
mod bulk_import;

pub use bulk_delete::{BulkDelete, DeleteProgress, DeleteState};
pub use bulk_import::{BulkImport, ImportState};

/// Registered name of [`BulkImport`]
pub const BULK_IMPORT: &str = "bulkImport";
/// Registered name of [`BulkDelete`]
pub const BULK_DELETE: &str = "bulkDelete";
