//! Mock operations.

use crate::context::{ContextDelta, Dataset};
use crate::operations::{Operation, OperationResult, OperationSchema, ResolvedParams, StepContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::time::Duration;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInvocation {
    /// Step name from the step context.
    pub step_name: String,
    /// Parameters the operation received.
    pub params: Value,
    /// Dataset names visible to the step.
    pub datasets: Vec<String>,
}

/// An operation that records every invocation and succeeds.
///
/// Accepts any parameters. If `output_key` is given, writes a one-row
/// dataset under that name so later steps can depend on it.
#[derive(Debug, Default)]
pub struct RecordingOperation {
    invocations: Mutex<Vec<RecordedInvocation>>,
}

impl RecordingOperation {
    /// Creates a new recording operation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded invocations.
    #[must_use]
    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.invocations.lock().clone()
    }

    /// Returns the number of invocations.
    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    /// Clears recorded invocations.
    pub fn clear(&self) {
        self.invocations.lock().clear();
    }
}

#[async_trait]
impl Operation for RecordingOperation {
    fn schema(&self) -> OperationSchema {
        OperationSchema::open()
    }

    async fn execute(&self, params: &ResolvedParams, step: &StepContext<'_>) -> OperationResult {
        self.invocations.lock().push(RecordedInvocation {
            step_name: step.step_name.to_string(),
            params: params.to_value(),
            datasets: step.context.dataset_names(),
        });

        let mut result = OperationResult::ok().with_summary("step", json!(step.step_name));
        if let Some(key) = params.get_str("output_key") {
            let mut row = serde_json::Map::new();
            row.insert("step".to_string(), json!(step.step_name));
            result = result.with_changes(
                ContextDelta::new().with_dataset(key, Dataset::from_rows(vec![row])),
            );
        }
        result
    }
}

/// An operation that always fails.
#[derive(Debug, Clone)]
pub struct FailingOperation {
    error: String,
}

impl FailingOperation {
    /// Creates a failing operation.
    #[must_use]
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[async_trait]
impl Operation for FailingOperation {
    fn schema(&self) -> OperationSchema {
        OperationSchema::open()
    }

    async fn execute(&self, _params: &ResolvedParams, _step: &StepContext<'_>) -> OperationResult {
        OperationResult::fail(&self.error)
    }
}

/// An operation that takes time to execute.
#[derive(Debug, Clone)]
pub struct SlowOperation {
    delay: Duration,
}

impl SlowOperation {
    /// Creates a new slow operation.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Creates a slow operation with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }
}

#[async_trait]
impl Operation for SlowOperation {
    fn schema(&self) -> OperationSchema {
        OperationSchema::open()
    }

    async fn execute(&self, _params: &ResolvedParams, _step: &StepContext<'_>) -> OperationResult {
        tokio::time::sleep(self.delay).await;
        OperationResult::ok().with_summary("slept_ms", json!(self.delay.as_millis()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::paths::PathResolver;

    fn run_with<F>(f: F)
    where
        F: FnOnce(&StepContext<'_>),
    {
        let context = ExecutionContext::new();
        let paths = PathResolver::new(".", vec![], "out");
        let step = StepContext {
            run_id: "r",
            step_name: "s1",
            operation_type: "MOCK",
            context: &context,
            paths: &paths,
            deadline: None,
        };
        f(&step);
    }

    #[tokio::test]
    async fn test_recording_operation_records() {
        let op = RecordingOperation::new();
        let context = ExecutionContext::new();
        let paths = PathResolver::new(".", vec![], "out");
        let step = StepContext {
            run_id: "r",
            step_name: "s1",
            operation_type: "MOCK",
            context: &context,
            paths: &paths,
            deadline: None,
        };
        let params = ResolvedParams::new(
            json!({"output_key": "d"}).as_object().cloned().unwrap_or_default(),
        );

        let result = op.execute(&params, &step).await;
        assert!(result.success);
        assert_eq!(result.changes.datasets["d"].len(), 1);
        assert_eq!(op.invocation_count(), 1);
        assert_eq!(op.invocations()[0].params["output_key"], "d");

        op.clear();
        assert_eq!(op.invocation_count(), 0);
    }

    #[test]
    fn test_failing_operation_fails() {
        run_with(|step| {
            let result = tokio_test::block_on(
                FailingOperation::new("boom").execute(&ResolvedParams::default(), step),
            );
            assert!(!result.success);
            assert_eq!(result.error_message(), "boom");
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_sleeps() {
        let context = ExecutionContext::new();
        let paths = PathResolver::new(".", vec![], "out");
        let step = StepContext {
            run_id: "r",
            step_name: "s1",
            operation_type: "MOCK",
            context: &context,
            paths: &paths,
            deadline: None,
        };
        let start = tokio::time::Instant::now();
        let result = SlowOperation::with_delay_ms(250)
            .execute(&ResolvedParams::default(), &step)
            .await;
        assert!(result.success);
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
