//! Registry mapping operation type names to factories.
//!
//! The registry is built once at startup and then shared read-only, so it
//! needs no interior locking. Lookups never fall back to a default: an
//! unregistered name is always an error.

use crate::errors::{DuplicateOperationError, UnknownOperationError};
use crate::operations::{builtin, Operation, OperationFactory};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Explicit mapping from operation type name to factory.
#[derive(Default, Clone)]
pub struct OperationRegistry {
    factories: HashMap<String, OperationFactory>,
}

impl OperationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in operations.
    pub fn with_builtins() -> Result<Self, DuplicateOperationError> {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry)?;
        Ok(registry)
    }

    /// Registers a factory under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: OperationFactory,
    ) -> Result<(), DuplicateOperationError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(DuplicateOperationError::new(name));
        }
        debug!(operation = %name, "Registered operation");
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Registers a shared instance; every lookup returns the same instance.
    pub fn register_instance(
        &mut self,
        name: impl Into<String>,
        operation: Arc<dyn Operation>,
    ) -> Result<(), DuplicateOperationError> {
        self.register(name, Arc::new(move || Arc::clone(&operation)))
    }

    /// Gets the factory for `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<OperationFactory> {
        self.factories.get(name).cloned()
    }

    /// Builds the operation for `name`.
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Arc<dyn Operation>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// Builds the operation a step names, or explains what is registered.
    pub fn require(
        &self,
        step: &str,
        name: &str,
    ) -> Result<Arc<dyn Operation>, UnknownOperationError> {
        self.create(name)
            .ok_or_else(|| UnknownOperationError::new(step, name, self.known_types()))
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn known_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("known_types", &self.known_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::builtin::{EchoOperation, ECHO, EXPORT_DATASET, INLINE_DATASET, NORMALIZE_COLUMN};

    #[test]
    fn test_registry_creation() {
        let registry = OperationRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.lookup(ECHO).is_none());
    }

    #[test]
    fn test_builtins_registered() {
        let registry = OperationRegistry::with_builtins().unwrap();
        let mut expected = vec![ECHO, EXPORT_DATASET, INLINE_DATASET, NORMALIZE_COLUMN];
        expected.sort_unstable();
        assert_eq!(registry.known_types(), expected);
        assert!(registry.create(NORMALIZE_COLUMN).is_some());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = OperationRegistry::with_builtins().unwrap();
        let err = registry
            .register_instance(ECHO, Arc::new(EchoOperation))
            .unwrap_err();
        assert_eq!(err.name, ECHO);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_require_unknown_lists_known_types() {
        let registry = OperationRegistry::with_builtins().unwrap();
        let err = registry.require("map_ids", "MAGIC").unwrap_err();

        assert_eq!(err.step, "map_ids");
        assert_eq!(err.operation_type, "MAGIC");
        assert!(err.to_string().contains("ECHO, EXPORT_DATASET"));
    }

    #[test]
    fn test_instance_is_shared() {
        let mut registry = OperationRegistry::new();
        let op: Arc<dyn Operation> = Arc::new(EchoOperation);
        registry.register_instance("E", Arc::clone(&op)).unwrap();

        let a = registry.create("E").unwrap();
        assert!(Arc::ptr_eq(&a, &op));
    }
}
