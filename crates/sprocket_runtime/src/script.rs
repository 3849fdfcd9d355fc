//! Script contract.

use crate::context::Context;
use crate::queue::{Completion, OperationError};
use sprocket_core::CoreError;

/// Error raised by a script; any error aborts the invocation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    /// An operation failed and the script re-raised it
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// The request body could not be used
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong
        reason: String,
    },

    /// Raised explicitly by the script
    #[error("{message}")]
    Raised {
        /// Script-supplied message
        message: String,
    },
}

impl ScriptError {
    /// Raise an error with a message
    pub fn raise(message: impl Into<String>) -> Self {
        Self::Raised {
            message: message.into(),
        }
    }

    /// Refuse the request body
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

impl From<CoreError> for ScriptError {
    fn from(err: CoreError) -> Self {
        Self::invalid_request(err.to_string())
    }
}

/// A server-side script.
///
/// The host calls [`Script::run`] once, then [`Script::on_complete`] once for
/// every operation the script got admitted. Scripts never block: they submit
/// operations through the context's collection and return, and pick up where
/// they left off when the completion arrives. The `tag` given at submission
/// comes back on the completion so a script can tell its continuations apart.
pub trait Script: Send {
    /// Entry point
    ///
    /// # Errors
    ///
    /// Any error aborts the invocation
    fn run(&mut self, ctx: &mut Context) -> Result<(), ScriptError>;

    /// Completion callback.
    ///
    /// The default re-raises operation errors and ignores results.
    ///
    /// # Errors
    ///
    /// Any error aborts the invocation
    fn on_complete(
        &mut self,
        _ctx: &mut Context,
        completion: Completion,
    ) -> Result<(), ScriptError> {
        completion.result.map(|_| ()).map_err(ScriptError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostConfig, ScriptHost};
    use crate::transaction::AbortReason;
    use serde_json::json;
    use sprocket_core::{CollectionLink, ReadOptions, ResourceId};
    use sprocket_storage::MemoryStore;
    use std::sync::Arc;

    /// Reads a missing document and keeps the default callback
    struct ReadsMissing;

    impl Script for ReadsMissing {
        fn run(&mut self, ctx: &mut Context) -> Result<(), ScriptError> {
            let link = ctx.collection().self_link().clone();
            ctx.collection_mut().read_document(
                &link,
                ResourceId::parse("ghost").map_err(ScriptError::from)?,
                ReadOptions::default(),
                0,
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_callback_reraises_operation_error() {
        let host = ScriptHost::new(Arc::new(MemoryStore::new()), HostConfig::default());
        let coll = CollectionLink::parse("orders").unwrap();
        let outcome = host
            .run_script(&mut ReadsMissing, &coll, json!(null))
            .await
            .unwrap();
        assert!(matches!(
            outcome.status.abort_reason(),
            Some(AbortReason::CallbackFailed { .. })
        ));
    }
}
