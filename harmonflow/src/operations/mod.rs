//! The operation plugin interface.
//!
//! An operation is the unit of work a step invokes. It declares an input
//! schema, receives validated parameters plus a read-only view of the
//! execution context, and returns an [`OperationResult`] whose
//! [`ContextDelta`] the executor applies on success.

pub mod builtin;
mod schema;

pub use schema::{
    ContextSlot, OperationSchema, ParamKind, ParamSpec, ResolvedParams, ValidatedParams,
};

use crate::context::{ContextDelta, Dataset, ExecutionContext};
use crate::errors::OperationError;
use crate::paths::PathResolver;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// A registered unit of work.
#[async_trait]
pub trait Operation: Send + Sync + fmt::Debug {
    /// The input contract.
    fn schema(&self) -> OperationSchema;

    /// Runs the operation.
    async fn execute(&self, params: &ResolvedParams, step: &StepContext<'_>) -> OperationResult;
}

/// Builds an operation instance for one step.
pub type OperationFactory = Arc<dyn Fn() -> Arc<dyn Operation> + Send + Sync>;

/// What an operation sees of the run it is part of.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    /// Run identifier.
    pub run_id: &'a str,
    /// Name of the step being executed.
    pub step_name: &'a str,
    /// Operation type the step invoked.
    pub operation_type: &'a str,
    /// The execution context as of the start of this step.
    pub context: &'a ExecutionContext,
    /// Resolver for any further paths the operation derives.
    pub paths: &'a PathResolver,
    /// When the step must finish, if a pipeline timeout is configured.
    pub deadline: Option<Instant>,
}

impl StepContext<'_> {
    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Gets a dataset, failing with a readable error if it is absent.
    pub fn require_dataset(&self, name: &str) -> Result<Arc<Dataset>, OperationError> {
        self.context.dataset(name).cloned().ok_or_else(|| {
            OperationError::new(format!(
                "dataset '{name}' not found; available: [{}]",
                self.context.dataset_names().join(", ")
            ))
        })
    }
}

/// Outcome of one operation invocation.
#[derive(Debug, Clone, Default)]
pub struct OperationResult {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message on failure.
    pub error: Option<String>,
    /// Operation-specific summary fields.
    pub summary: Map<String, Value>,
    /// Context writes, applied only on success.
    pub changes: ContextDelta,
}

impl OperationResult {
    /// A successful result with no summary.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// A failed result.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Adds a summary field.
    #[must_use]
    pub fn with_summary(mut self, key: impl Into<String>, value: Value) -> Self {
        self.summary.insert(key.into(), value);
        self
    }

    /// Sets the context writes.
    #[must_use]
    pub fn with_changes(mut self, changes: ContextDelta) -> Self {
        self.changes = changes;
        self
    }

    /// Error message, or a generic one if the operation left it empty.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "operation reported failure without a message".to_string())
    }
}

impl From<OperationError> for OperationResult {
    fn from(err: OperationError) -> Self {
        Self::fail(err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_factories() {
        let ok = OperationResult::ok().with_summary("rows", json!(3));
        assert!(ok.success);
        assert_eq!(ok.summary["rows"], json!(3));

        let failed = OperationResult::fail("boom");
        assert!(!failed.success);
        assert_eq!(failed.error_message(), "boom");

        let bare = OperationResult::default();
        assert!(bare.error_message().contains("without a message"));
    }

    #[test]
    fn test_require_dataset_lists_available() {
        let mut context = ExecutionContext::new();
        context.set_dataset("proteins", Dataset::default());
        let paths = PathResolver::new(".", vec![], "out");
        let step = StepContext {
            run_id: "r",
            step_name: "s",
            operation_type: "OP",
            context: &context,
            paths: &paths,
            deadline: None,
        };

        assert!(step.require_dataset("proteins").is_ok());
        let err = step.require_dataset("metabolites").unwrap_err();
        assert!(err.message.contains("available: [proteins]"));
        assert!(step.remaining().is_none());
    }
}
