//! Registry of stored procedures.

use crate::procedures::{BulkDelete, BulkImport, BULK_DELETE, BULK_IMPORT};
use crate::script::Script;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Builds a fresh script instance per invocation
pub type ScriptFactory = Arc<dyn Fn() -> Box<dyn Script> + Send + Sync>;

/// Error from registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Name already taken
    AlreadyRegistered {
        /// Procedure name
        name: String,
    },
    /// No procedure under that name
    NotFound {
        /// Procedure name
        name: String,
    },
    /// Names must be non-empty and free of whitespace
    InvalidName {
        /// Offending name
        name: String,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered { name } => write!(f, "Procedure already registered: {name}"),
            Self::NotFound { name } => write!(f, "Procedure not found: {name}"),
            Self::InvalidName { name } => write!(f, "Invalid procedure name: {name:?}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Named script factories, in registration order
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    factories: IndexMap<String, ScriptFactory>,
}

impl ScriptRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in procedures
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut factories: IndexMap<String, ScriptFactory> = IndexMap::new();
        factories.insert(
            BULK_IMPORT.to_string(),
            Arc::new(|| Box::new(BulkImport::new()) as Box<dyn Script>),
        );
        factories.insert(
            BULK_DELETE.to_string(),
            Arc::new(|| Box::new(BulkDelete::new()) as Box<dyn Script>),
        );
        Self { factories }
    }

    /// Register a procedure
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken or malformed
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn() -> Box<dyn Script> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidName { name });
        }
        if self.factories.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered { name });
        }
        tracing::debug!(procedure = %name, "registered");
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Remove a procedure
    ///
    /// # Errors
    ///
    /// Returns error if nothing is registered under the name
    pub fn unregister(&mut self, name: &str) -> Result<(), RegistryError> {
        self.factories
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }

    /// Instantiate a procedure
    ///
    /// # Errors
    ///
    /// Returns error if nothing is registered under the name
    pub fn create(&self, name: &str) -> Result<Box<dyn Script>, RegistryError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })?;
        Ok(factory())
    }

    /// Whether a procedure is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Number of procedures
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
