//! The pipeline executor.
//!
//! Runs a definition as a straight-line program: resolve parameters and
//! metadata once, then for each step resolve, validate, dispatch and merge.
//! Steps never run concurrently and the executor never retries a step.

use super::definition::{FailurePolicy, PipelineDefinition, Step};
use super::state::{PipelineOutcome, RunState, RunStatus, StepFailure, StepFailureKind};
use crate::config::{timeout_from_secs, EngineConfig, EnvSource, ProcessEnv};
use crate::context::{ExecutionContext, ProvenanceRecord};
use crate::errors::{EngineWarning, HarmonflowError, UnknownOperationError};
use crate::events::{
    EventSink, NoOpEventSink, RunEvents, PIPELINE_COMPLETED, PIPELINE_FAILED,
    PIPELINE_PARAMETERS_RESOLVED, PIPELINE_STARTED, STEP_COMPLETED, STEP_FAILED, STEP_STARTED,
    STEP_SKIPPED_FAILURE,
};
use crate::observability::SpanTimer;
use crate::operations::{OperationResult, StepContext};
use crate::paths::{PathMode, PathResolver};
use crate::registry::OperationRegistry;
use crate::resolver::{ExpressionResolver, Namespace};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Metadata keys whose entries carry a `path` resolved at run start.
const FILE_DESCRIPTOR_KEYS: [&str; 2] = ["source_files", "target_files"];

/// Executes pipeline definitions against an operation registry.
pub struct PipelineExecutor {
    registry: Arc<OperationRegistry>,
    config: EngineConfig,
    env: Arc<dyn EnvSource>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PipelineExecutor {
    /// Creates an executor with default configuration, the process
    /// environment and no event sink.
    #[must_use]
    pub fn new(registry: Arc<OperationRegistry>) -> Self {
        Self {
            registry,
            config: EngineConfig::default(),
            env: Arc::new(ProcessEnv),
            sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the environment consulted by `${env.*}` references.
    #[must_use]
    pub fn with_env(mut self, env: Arc<dyn EnvSource>) -> Self {
        self.env = env;
        self
    }

    /// Sets the lifecycle event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The operation registry.
    #[must_use]
    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Checks that every step names a registered operation.
    pub fn check_operations(&self, definition: &PipelineDefinition) -> Result<(), UnknownOperationError> {
        for step in &definition.steps {
            if !self.registry.contains(step.operation_type()) {
                return Err(UnknownOperationError::new(
                    &step.name,
                    step.operation_type(),
                    self.registry.known_types(),
                ));
            }
        }
        Ok(())
    }

    /// Runs a pipeline.
    ///
    /// Returns `Err` only for pre-run failures: an invalid definition, a
    /// parameter cycle, or (with eager validation) an unknown operation type.
    /// Everything after that is reported through the outcome.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        invocation: &Map<String, Value>,
    ) -> Result<PipelineOutcome, HarmonflowError> {
        definition
            .validate()
            .map_err(|e| e.with_pipeline(&definition.name))?;
        if self.config.validate_operations_eagerly {
            self.check_operations(definition)?;
        }

        let run = Run::new(self, definition);
        run.execute(invocation).await
    }
}

/// What to do after a step failure.
enum Disposition {
    Continue,
    Halt(StepFailure),
}

/// State for one pipeline run.
struct Run<'a> {
    executor: &'a PipelineExecutor,
    definition: &'a PipelineDefinition,
    run_id: String,
    state: RunState,
    events: RunEvents,
    resolver: ExpressionResolver,
    paths: PathResolver,
    namespace: Namespace,
    context: ExecutionContext,
    tolerated: Vec<StepFailure>,
    parameter_warnings: Vec<EngineWarning>,
    timeout: Option<Duration>,
}

impl<'a> Run<'a> {
    fn new(executor: &'a PipelineExecutor, definition: &'a PipelineDefinition) -> Self {
        let config = &executor.config;
        let run_id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let namespace = Namespace::new(Arc::clone(&executor.env))
            .with_env_defaults(config.env_defaults())
            .with_builtin("run_id", run_id.clone())
            .with_builtin("pipeline_name", definition.name.clone())
            .with_builtin("pipeline_version", definition.version.clone())
            .with_builtin("timestamp", now.to_rfc3339())
            .with_builtin("date", now.format("%Y-%m-%d").to_string())
            .with_builtin("data_dir", config.data_dir.display().to_string())
            .with_builtin("cache_dir", config.cache_dir.display().to_string())
            .with_builtin("output_dir", config.output_dir.display().to_string())
            .with_builtin("config_dir", config.config_dir.display().to_string());

        let timeout = definition
            .config
            .timeout_seconds
            .and_then(timeout_from_secs)
            .or_else(|| config.pipeline_timeout());

        Self {
            executor,
            definition,
            events: RunEvents::new(
                Arc::clone(&executor.sink),
                run_id.clone(),
                definition.name.clone(),
            ),
            run_id,
            state: RunState::Loaded,
            resolver: ExpressionResolver::new(config.max_substitution_passes),
            paths: PathResolver::from_config(config),
            namespace,
            context: ExecutionContext::new(),
            tolerated: Vec::new(),
            parameter_warnings: Vec::new(),
            timeout,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        debug!(run_id = %self.run_id, from = %self.state, to = %next, "Run state transition");
        self.state = next;
    }

    async fn execute(mut self, invocation: &Map<String, Value>) -> Result<PipelineOutcome, HarmonflowError> {
        let timer = SpanTimer::start(format!("pipeline:{}", self.definition.name));
        info!(
            run_id = %self.run_id,
            pipeline = %self.definition.name,
            version = %self.definition.version,
            steps = self.definition.steps.len(),
            "Pipeline started"
        );
        self.events
            .emit(
                PIPELINE_STARTED,
                json!({
                    "version": self.definition.version,
                    "steps": self.definition.steps.len(),
                }),
            )
            .await;

        self.transition(RunState::ResolvingParameters);
        if let Err(err) = self.resolve_run_scopes(invocation) {
            error!(run_id = %self.run_id, error = %err, "Parameter resolution failed");
            self.events
                .emit(PIPELINE_FAILED, json!({ "code": err.code(), "error": err.to_string() }))
                .await;
            return Err(err);
        }
        self.events
            .emit(
                PIPELINE_PARAMETERS_RESOLVED,
                json!({
                    "parameters": self.namespace.parameters().len(),
                    "warnings": self.parameter_warnings,
                }),
            )
            .await;

        let deadline = self.timeout.and_then(|t| Instant::now().checked_add(t));
        let definition = self.definition;
        for (index, step) in definition.steps.iter().enumerate() {
            self.transition(RunState::Running(index));
            if let Disposition::Halt(failure) = self.run_step(index, step, deadline).await {
                self.transition(RunState::Failed);
                let duration_ms = timer.finish();
                error!(
                    run_id = %self.run_id,
                    pipeline = %self.definition.name,
                    step = %failure.step_name,
                    error = %failure,
                    "Pipeline failed"
                );
                self.events
                    .emit(
                        PIPELINE_FAILED,
                        json!({
                            "step": failure.step_name,
                            "kind": failure.kind,
                            "error": failure.message,
                            "duration_ms": duration_ms,
                        }),
                    )
                    .await;
                return Ok(self.finish(RunStatus::Failed, Some(failure), duration_ms));
            }
        }

        self.transition(RunState::Completed);
        let duration_ms = timer.finish();
        info!(
            run_id = %self.run_id,
            pipeline = %self.definition.name,
            tolerated_failures = self.tolerated.len(),
            duration_ms,
            "Pipeline completed"
        );
        self.events
            .emit(
                PIPELINE_COMPLETED,
                json!({
                    "duration_ms": duration_ms,
                    "tolerated_failures": self.tolerated.len(),
                }),
            )
            .await;
        Ok(self.finish(RunStatus::Completed, None, duration_ms))
    }

    fn finish(self, status: RunStatus, failure: Option<StepFailure>, duration_ms: f64) -> PipelineOutcome {
        PipelineOutcome {
            run_id: self.run_id,
            pipeline: self.definition.name.clone(),
            status,
            context: self.context,
            failure,
            tolerated_failures: self.tolerated,
            parameter_warnings: self.parameter_warnings,
            duration_ms,
        }
    }

    /// Resolves parameters, then metadata, then metadata file paths.
    ///
    /// Parameter warnings go to the outcome; metadata warnings become a
    /// `metadata` provenance record.
    fn resolve_run_scopes(&mut self, invocation: &Map<String, Value>) -> Result<(), HarmonflowError> {
        let parameters = self.resolver.resolve_parameters(
            &self.definition.parameters,
            invocation,
            &mut self.namespace,
        )?;
        self.parameter_warnings = parameters.warnings;

        let metadata = self
            .resolver
            .resolve_metadata(&self.definition.metadata, &mut self.namespace);
        let mut warnings = metadata.warnings;
        let mut values = metadata.values;
        for key in FILE_DESCRIPTOR_KEYS {
            if let Some(Value::Array(entries)) = values.get_mut(key) {
                for entry in entries.iter_mut() {
                    self.resolve_descriptor(entry, &mut warnings);
                }
            }
        }
        self.namespace.set_metadata(values);

        if !warnings.is_empty() {
            self.context
                .append_provenance(ProvenanceRecord::from_warnings("metadata", &warnings));
        }
        Ok(())
    }

    /// Resolves a file descriptor's `path` in place and marks whether it exists.
    fn resolve_descriptor(&self, entry: &mut Value, warnings: &mut Vec<EngineWarning>) {
        let Some(descriptor) = entry.as_object_mut() else { return };
        let Some(raw) = descriptor.get("path").and_then(Value::as_str) else { return };

        let resolved = self.paths.resolve(raw, PathMode::Input);
        if let Some(warning) = resolved.warning {
            warnings.push(warning);
        }
        if resolved.found {
            descriptor.insert(
                "path".to_string(),
                Value::String(resolved.path.display().to_string()),
            );
        }
        descriptor.insert("found".to_string(), Value::Bool(resolved.found));
    }

    async fn run_step(&mut self, index: usize, step: &Step, deadline: Option<Instant>) -> Disposition {
        let timer = SpanTimer::start(format!("step:{}", step.name));
        let operation_type = step.operation_type();
        let policy = step.effective_policy(self.definition.config.failure_policy);

        self.namespace.set_step_scopes(
            self.context.statistics_scope(),
            self.context.datasets_scope(),
            self.context.outputs_scope(),
        );
        info!(run_id = %self.run_id, step = %step.name, operation = %operation_type, index, "Step started");
        self.events
            .emit(
                STEP_STARTED,
                json!({ "step": step.name, "index": index, "operation": operation_type }),
            )
            .await;

        let operation = match self.executor.registry.require(&step.name, operation_type) {
            Ok(op) => op,
            Err(err) => {
                // Always fatal, whatever the step's policy.
                let failure = self.failure(
                    index,
                    step,
                    Value::Object(step.raw_params().clone()),
                    StepFailureKind::UnknownOperation,
                    err.to_string(),
                );
                return self.on_failure(failure, FailurePolicy::Strict, &[]).await;
            }
        };
        let schema = operation.schema();

        let mut warnings = Vec::new();
        let mut resolved = Map::new();
        for (name, raw) in step.raw_params() {
            let value = self
                .resolver
                .resolve_with(raw, &self.namespace, schema.coercion_for(name));
            for warning in value.warnings {
                if !warnings.contains(&warning) {
                    warnings.push(warning);
                }
            }
            resolved.insert(name.clone(), value.value);
        }

        let validated = match schema.validate(operation_type, resolved.clone(), &self.paths) {
            Ok(validated) => validated,
            Err(err) => {
                let failure = self.failure(
                    index,
                    step,
                    Value::Object(resolved),
                    StepFailureKind::Validation,
                    err.violations.join("; "),
                );
                return self.on_failure(failure, policy, &warnings).await;
            }
        };
        warnings.extend(validated.warnings);
        let params = validated.params;

        let result = {
            let step_context = StepContext {
                run_id: &self.run_id,
                step_name: &step.name,
                operation_type,
                context: &self.context,
                paths: &self.paths,
                deadline,
            };
            let invocation = operation.execute(&params, &step_context);
            match deadline {
                Some(at) => tokio::time::timeout_at(at, invocation).await.ok(),
                None => Some(invocation.await),
            }
        };

        let (kind, message) = match result {
            Some(result) if result.success => {
                self.on_success(index, step, params.to_value(), result, warnings, timer)
                    .await;
                return Disposition::Continue;
            }
            Some(result) => (StepFailureKind::Execution, result.error_message()),
            None => (
                StepFailureKind::Timeout,
                format!(
                    "exceeded the pipeline deadline ({:.3}s)",
                    self.timeout.unwrap_or_default().as_secs_f64()
                ),
            ),
        };
        let failure = self.failure(index, step, params.to_value(), kind, message);
        self.on_failure(failure, policy, &warnings).await
    }

    async fn on_success(
        &mut self,
        index: usize,
        step: &Step,
        params: Value,
        result: OperationResult,
        warnings: Vec<EngineWarning>,
        timer: SpanTimer,
    ) {
        let duration_ms = timer.finish();
        let writes = result.changes.describe();
        self.context.apply(result.changes);
        self.context.append_provenance(ProvenanceRecord::new(
            &step.name,
            json!({
                "operation": step.operation_type(),
                "params": params,
                "summary": result.summary,
                "duration_ms": duration_ms,
                "warnings": warnings,
                "writes": writes,
            }),
        ));

        info!(
            run_id = %self.run_id,
            step = %step.name,
            index,
            duration_ms,
            "Step completed"
        );
        self.events
            .emit(
                STEP_COMPLETED,
                json!({
                    "step": step.name,
                    "index": index,
                    "operation": step.operation_type(),
                    "duration_ms": duration_ms,
                }),
            )
            .await;
    }

    fn failure(
        &self,
        index: usize,
        step: &Step,
        resolved_params: Value,
        kind: StepFailureKind,
        message: String,
    ) -> StepFailure {
        StepFailure {
            step_index: index,
            step_name: step.name.clone(),
            operation_type: step.operation_type().to_string(),
            resolved_params,
            kind,
            message,
        }
    }

    async fn on_failure(
        &mut self,
        failure: StepFailure,
        policy: FailurePolicy,
        warnings: &[EngineWarning],
    ) -> Disposition {
        let event = json!({
            "step": failure.step_name,
            "index": failure.step_index,
            "operation": failure.operation_type,
            "kind": failure.kind,
            "error": failure.message,
            "policy": policy.as_str(),
        });

        match policy {
            FailurePolicy::Strict => {
                self.events.emit(STEP_FAILED, event).await;
                return Disposition::Halt(failure);
            }
            FailurePolicy::Warn => {
                warn!(
                    run_id = %self.run_id,
                    step = %failure.step_name,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Step failed; continuing"
                );
                self.context.append_provenance(ProvenanceRecord::warning(
                    &failure.step_name,
                    json!({
                        "operation": failure.operation_type,
                        "kind": failure.kind,
                        "error": failure.message,
                        "params": failure.resolved_params,
                        "warnings": warnings,
                    }),
                ));
            }
            FailurePolicy::Ignore => {
                debug!(
                    run_id = %self.run_id,
                    step = %failure.step_name,
                    error = %failure.message,
                    "Step failed; ignored"
                );
            }
        }

        self.events.emit(STEP_SKIPPED_FAILURE, event).await;
        self.tolerated.push(failure);
        Disposition::Continue
    }
}
