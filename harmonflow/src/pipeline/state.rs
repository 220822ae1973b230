//! Run states and outcomes.

use crate::context::ExecutionContext;
use crate::errors::{EngineWarning, HarmonflowError, OperationExecutionError, ParameterValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum RunState {
    /// The definition is loaded and validated.
    Loaded,
    /// Parameters and metadata are being resolved.
    ResolvingParameters,
    /// The step at this index is running.
    Running(usize),
    /// Every step finished.
    Completed,
    /// A step failed under a strict policy.
    Failed,
}

impl RunState {
    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Loaded, Self::ResolvingParameters)
            | (Self::ResolvingParameters | Self::Running(_), Self::Completed | Self::Failed) => true,
            (Self::ResolvingParameters, Self::Running(i)) => i == 0,
            (Self::Running(i), Self::Running(j)) => j == i + 1,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Loaded => f.write_str("loaded"),
            Self::ResolvingParameters => f.write_str("resolving_parameters"),
            Self::Running(i) => write!(f, "running({i})"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step ran (some failures may have been tolerated).
    Completed,
    /// A step failed under a strict policy.
    Failed,
}

/// Why a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureKind {
    /// Parameters did not satisfy the operation schema.
    Validation,
    /// The operation reported failure.
    Execution,
    /// The step exceeded the pipeline deadline.
    Timeout,
    /// The operation type is not registered.
    UnknownOperation,
}

impl fmt::Display for StepFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Timeout => "timeout",
            Self::UnknownOperation => "unknown_operation",
        };
        f.write_str(name)
    }
}

/// Everything needed to reproduce a failed step.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Step '{step_name}' ({operation_type}) failed with {kind} error: {message}")]
pub struct StepFailure {
    /// Zero-based step index.
    pub step_index: usize,
    /// Step name.
    pub step_name: String,
    /// Operation type.
    pub operation_type: String,
    /// Parameters in effect, after substitution.
    pub resolved_params: Value,
    /// Failure category.
    pub kind: StepFailureKind,
    /// Underlying error message.
    pub message: String,
}

impl From<StepFailure> for HarmonflowError {
    fn from(failure: StepFailure) -> Self {
        match failure.kind {
            StepFailureKind::Validation => ParameterValidationError::new(
                failure.operation_type,
                failure.message.split("; ").map(str::to_string).collect(),
            )
            .with_step(failure.step_name)
            .into(),
            _ => OperationExecutionError::new(
                failure.step_name,
                failure.operation_type,
                failure.message,
            )
            .with_resolved_params(failure.resolved_params)
            .into(),
        }
    }
}

/// Result of running a pipeline past the pre-run checks.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Run identifier.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Final status.
    pub status: RunStatus,
    /// The context as of the end of the run; on failure it holds every
    /// effect up to the failed step.
    pub context: ExecutionContext,
    /// The fatal failure, when `status` is `Failed`.
    pub failure: Option<StepFailure>,
    /// Failures let through by `warn` or `ignore`.
    pub tolerated_failures: Vec<StepFailure>,
    /// Non-fatal conditions raised while resolving the `parameters` block.
    pub parameter_warnings: Vec<EngineWarning>,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

impl PipelineOutcome {
    /// Returns true if the run completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Converts into the final context or the fatal step failure.
    pub fn into_result(self) -> Result<ExecutionContext, StepFailure> {
        match self.failure {
            Some(failure) => Err(failure),
            None => Ok(self.context),
        }
    }
}
