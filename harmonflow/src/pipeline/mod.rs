//! Pipeline definitions and execution.
//!
//! This module provides:
//! - The in-memory pipeline definition and its YAML/JSON loader
//! - The sequential pipeline executor
//! - Run states and outcomes

mod definition;
mod executor;
pub mod loader;
mod state;


pub use definition::{Action, FailurePolicy, PipelineConfig, PipelineDefinition, Step};
pub use executor::PipelineExecutor;
pub use state::{PipelineOutcome, RunState, RunStatus, StepFailure, StepFailureKind};

use crate::config::{EngineConfig, ProcessEnv};
use crate::context::ExecutionContext;
use crate::errors::HarmonflowError;
use crate::registry::OperationRegistry;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Runs a pipeline with the built-in operations and configuration taken
/// from the process environment.
///
/// A strict step failure is returned as an error carrying the step name,
/// operation type, resolved parameters and message.
pub async fn run_pipeline(
    definition: &PipelineDefinition,
    invocation: &Map<String, Value>,
) -> Result<ExecutionContext, HarmonflowError> {
    let registry = OperationRegistry::with_builtins()?;
    let executor = PipelineExecutor::new(Arc::new(registry))
        .with_config(EngineConfig::from_env(&ProcessEnv));
    let outcome = executor.run(definition, invocation).await?;
    outcome.into_result().map_err(HarmonflowError::from)
}
