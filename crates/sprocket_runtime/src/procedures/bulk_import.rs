//! Bulk import: create a sequence of documents, one at a time.
//!
//! The request body is either a JSON array of documents or
//! `{"documents": [...], "options": CreateOptions}`. The response is the
//! number of documents created. When the gate refuses a document the script
//! stops there and the committed response tells the caller where to resume.

use crate::admission::AdmissionDecision;
use crate::context::Context;
use crate::queue::Completion;
use crate::script::{Script, ScriptError};
use serde::Deserialize;
use serde_json::Value;
use sprocket_core::{CreateOptions, Document};
use std::collections::VecDeque;

#[derive(Deserialize)]
#[serde(untagged)]
enum ImportBody {
    Documents(Vec<Value>),
    Wrapped {
        documents: Vec<Value>,
        #[serde(default)]
        options: CreateOptions,
    },
}

/// Cursor of a bulk import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportState {
    /// Nothing submitted yet
    Pending,
    /// Waiting for the create of input `index`
    OperationInFlight {
        /// Input position
        index: usize,
    },
    /// Finished, fully or up to a rejection
    Done,
    /// A create failed
    Aborted,
}

/// Bulk import procedure
#[derive(Debug)]
pub struct BulkImport {
    remaining: VecDeque<Document>,
    options: CreateOptions,
    count: usize,
    state: ImportState,
}

impl BulkImport {
    /// Create an import waiting for its request
    #[must_use]
    pub fn new() -> Self {
        Self {
            remaining: VecDeque::new(),
            options: CreateOptions::default(),
            count: 0,
            state: ImportState::Pending,
        }
    }

    /// Current cursor state
    #[must_use]
    pub const fn state(&self) -> ImportState {
        self.state
    }

    /// Documents created so far
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    fn finish(&mut self, ctx: &mut Context) {
        ctx.response_mut().set_body(self.count);
        self.state = ImportState::Done;
    }

    fn submit_next(&mut self, ctx: &mut Context) {
        let Some(document) = self.remaining.pop_front() else {
            self.finish(ctx);
            return;
        };
        let index = self.count;
        let link = ctx.collection().self_link().clone();
        match ctx
            .collection_mut()
            .create_document(&link, document, self.options.clone(), index as u64)
        {
            AdmissionDecision::Accepted(_) => {
                self.state = ImportState::OperationInFlight { index };
            }
            AdmissionDecision::Rejected(_) => self.finish(ctx),
        }
    }
}

impl Default for BulkImport {
    fn default() -> Self {
        Self::new()
    }
}

impl Script for BulkImport {
    fn run(&mut self, ctx: &mut Context) -> Result<(), ScriptError> {
        let body: ImportBody = serde_json::from_value(ctx.request().body().clone())
            .map_err(|e| ScriptError::invalid_request(e.to_string()))?;
        let (documents, options) = match body {
            ImportBody::Documents(documents) => (documents, CreateOptions::default()),
            ImportBody::Wrapped { documents, options } => (documents, options),
        };
        self.remaining = documents
            .into_iter()
            .map(Document::from_value)
            .collect::<Result<_, _>>()?;
        self.options = options;
        self.submit_next(ctx);
        Ok(())
    }

    fn on_complete(&mut self, ctx: &mut Context, completion: Completion) -> Result<(), ScriptError> {
        match self.state {
            ImportState::OperationInFlight { index } if completion.tag == index as u64 => {}
            state => {
                self.state = ImportState::Aborted;
                return Err(ScriptError::raise(format!(
                    "unexpected completion {} in state {state:?}",
                    completion.operation
                )));
            }
        }
        if let Err(err) = completion.result {
            self.state = ImportState::Aborted;
            return Err(err.into());
        }
        self.count += 1;
        self.submit_next(ctx);
        Ok(())
    }
}
