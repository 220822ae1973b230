//! Test fixtures.

use crate::config::{EngineConfig, MapEnv};
use crate::errors::HarmonflowError;
use crate::events::CollectingEventSink;
use crate::operations::Operation;
use crate::pipeline::{FailurePolicy, PipelineDefinition, PipelineExecutor, PipelineOutcome, Step};
use crate::registry::OperationRegistry;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Builds a pipeline plus everything needed to run it in isolation.
///
/// The environment is an empty [`MapEnv`], events are collected in memory
/// and the registry starts with the built-in operations.
#[derive(Debug)]
pub struct PipelineFixture {
    definition: PipelineDefinition,
    registry: OperationRegistry,
    env: MapEnv,
    config: EngineConfig,
    invocation: Map<String, Value>,
    events: Arc<CollectingEventSink>,
}

impl PipelineFixture {
    /// Creates a fixture for an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            definition: PipelineDefinition::new(name),
            registry: OperationRegistry::with_builtins().unwrap_or_default(),
            env: MapEnv::new(),
            config: EngineConfig::default(),
            invocation: Map::new(),
            events: Arc::new(CollectingEventSink::new()),
        }
    }

    /// Adds a step.
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.definition.steps.push(step);
        self
    }

    /// Adds `count` steps named `step_1..=step_count` invoking `operation_type`.
    #[must_use]
    pub fn with_linear_steps(mut self, count: usize, operation_type: &str) -> Self {
        for i in 1..=count {
            self.definition
                .steps
                .push(Step::new(format!("step_{i}"), operation_type));
        }
        self
    }

    /// Adds a definition parameter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.definition.parameters.insert(name.into(), value);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.definition.metadata.insert(key.into(), value);
        self
    }

    /// Sets the pipeline failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.definition.config.failure_policy = policy;
        self
    }

    /// Sets the pipeline timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.definition.config.timeout_seconds = Some(seconds);
        self
    }

    /// Adds an invocation-time parameter.
    #[must_use]
    pub fn with_invocation_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.invocation.insert(name.into(), value);
        self
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env = self.env.with(key, value);
        self
    }

    /// Replaces the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers an operation instance.
    ///
    /// # Panics
    ///
    /// Panics if `name` is already registered.
    #[must_use]
    pub fn with_operation(mut self, name: &str, operation: Arc<dyn Operation>) -> Self {
        if let Err(err) = self.registry.register_instance(name, operation) {
            panic!("fixture registration failed: {err}");
        }
        self
    }

    /// The definition built so far.
    #[must_use]
    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    /// Collected lifecycle events.
    #[must_use]
    pub fn events(&self) -> Arc<CollectingEventSink> {
        Arc::clone(&self.events)
    }

    /// Builds the executor.
    #[must_use]
    pub fn executor(&self) -> PipelineExecutor {
        PipelineExecutor::new(Arc::new(self.registry.clone()))
            .with_config(self.config.clone())
            .with_env(Arc::new(self.env.clone()))
            .with_event_sink(self.events.clone())
    }

    /// Runs the pipeline.
    pub async fn run(&self) -> Result<PipelineOutcome, HarmonflowError> {
        self.executor().run(&self.definition, &self.invocation).await
    }
}
