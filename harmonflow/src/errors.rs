//! Error types for the harmonflow engine.
//!
//! Fatal conditions are `Error` types gathered under [`HarmonflowError`].
//! Non-fatal conditions (unresolved references, path fallbacks) are
//! [`EngineWarning`] values: they are logged and recorded on provenance but
//! never abort a run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for harmonflow operations.
#[derive(Debug, Error)]
pub enum HarmonflowError {
    /// The pipeline definition is malformed.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The `parameters` block contains a reference cycle.
    #[error("{0}")]
    CircularReference(#[from] CircularReferenceError),

    /// A step names an operation type nobody registered.
    #[error("{0}")]
    UnknownOperation(#[from] UnknownOperationError),

    /// Resolved step parameters did not satisfy the operation schema.
    #[error("{0}")]
    ParameterValidation(#[from] ParameterValidationError),

    /// An operation reported failure.
    #[error("{0}")]
    OperationExecution(#[from] OperationExecutionError),

    /// The same operation name was registered twice.
    #[error("{0}")]
    DuplicateOperation(#[from] DuplicateOperationError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl HarmonflowError {
    /// Stable machine-readable code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "HF-CONFIG",
            Self::CircularReference(_) => "HF-CYCLE",
            Self::UnknownOperation(_) => "HF-UNKNOWN-OP",
            Self::ParameterValidation(_) => "HF-PARAM",
            Self::OperationExecution(_) => "HF-EXEC",
            Self::DuplicateOperation(_) => "HF-DUPLICATE-OP",
            Self::Io(_) => "HF-IO",
            Self::Serialization(_) => "HF-SERDE",
        }
    }

    /// Returns true for errors that abort a run before any step executes.
    #[must_use]
    pub fn is_pre_run(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::CircularReference(_)
                | Self::UnknownOperation(_)
                | Self::DuplicateOperation(_)
        )
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::CircularReference(err) => {
                map.insert("chain".to_string(), serde_json::json!(err.chain));
            }
            Self::UnknownOperation(err) => {
                map.insert("step".to_string(), serde_json::json!(err.step));
                map.insert("operation_type".to_string(), serde_json::json!(err.operation_type));
                map.insert("known_types".to_string(), serde_json::json!(err.known_types));
            }
            Self::ParameterValidation(err) => {
                map.insert("step".to_string(), serde_json::json!(err.step));
                map.insert("violations".to_string(), serde_json::json!(err.violations));
            }
            Self::OperationExecution(err) => {
                map.insert("step".to_string(), serde_json::json!(err.step));
                map.insert("operation_type".to_string(), serde_json::json!(err.operation_type));
                map.insert("resolved_params".to_string(), err.resolved_params.clone());
            }
            _ => {}
        }

        map
    }
}

impl From<serde_json::Error> for HarmonflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error raised when a pipeline definition is malformed.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The pipeline involved, when known.
    pub pipeline: Option<String>,
    /// The offending field, when known.
    pub field: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            pipeline: None,
            field: None,
        }
    }

    /// Sets the pipeline name.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline.into());
        self
    }

    /// Sets the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Error raised when parameters reference each other in a cycle.
#[derive(Debug, Clone, Error)]
#[error("Circular parameter reference: {}", chain.join(" -> "))]
pub struct CircularReferenceError {
    /// The reference chain, starting and ending at the same parameter.
    pub chain: Vec<String>,
}

impl CircularReferenceError {
    /// Creates a new circular reference error.
    #[must_use]
    pub fn new(chain: Vec<String>) -> Self {
        Self { chain }
    }

    /// Returns each parameter in the cycle once, in chain order.
    #[must_use]
    pub fn nodes(&self) -> Vec<&str> {
        let mut nodes: Vec<&str> = Vec::new();
        for name in &self.chain {
            if !nodes.contains(&name.as_str()) {
                nodes.push(name);
            }
        }
        nodes
    }
}

/// Error raised when a step names an unregistered operation type.
#[derive(Debug, Clone, Error)]
#[error(
    "Step '{step}' references unknown operation type '{operation_type}'; known types: [{}]",
    known_types.join(", ")
)]
pub struct UnknownOperationError {
    /// The offending step.
    pub step: String,
    /// The unknown operation type.
    pub operation_type: String,
    /// Every registered operation type, sorted.
    pub known_types: Vec<String>,
}

impl UnknownOperationError {
    /// Creates a new unknown operation error.
    #[must_use]
    pub fn new(
        step: impl Into<String>,
        operation_type: impl Into<String>,
        known_types: Vec<String>,
    ) -> Self {
        Self {
            step: step.into(),
            operation_type: operation_type.into(),
            known_types,
        }
    }
}

/// Error raised when resolved parameters violate an operation schema.
#[derive(Debug, Clone, Error)]
#[error(
    "Invalid parameters for operation '{operation_type}'{}: {}",
    step.as_ref().map(|s| format!(" in step '{s}'")).unwrap_or_default(),
    violations.join("; ")
)]
pub struct ParameterValidationError {
    /// The step being validated, when known.
    pub step: Option<String>,
    /// The operation type whose schema was applied.
    pub operation_type: String,
    /// Every violation found.
    pub violations: Vec<String>,
}

impl ParameterValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(operation_type: impl Into<String>, violations: Vec<String>) -> Self {
        Self {
            step: None,
            operation_type: operation_type.into(),
            violations,
        }
    }

    /// Sets the step name.
    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

/// Error raised when an operation fails during a step.
#[derive(Debug, Clone, Error)]
#[error("Step '{step}' ({operation_type}) failed: {message}")]
pub struct OperationExecutionError {
    /// The failing step.
    pub step: String,
    /// The operation type.
    pub operation_type: String,
    /// The underlying error message.
    pub message: String,
    /// Parameters in effect when the step failed.
    pub resolved_params: serde_json::Value,
}

impl OperationExecutionError {
    /// Creates a new execution error.
    #[must_use]
    pub fn new(
        step: impl Into<String>,
        operation_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step: step.into(),
            operation_type: operation_type.into(),
            message: message.into(),
            resolved_params: serde_json::Value::Null,
        }
    }

    /// Attaches the resolved parameters.
    #[must_use]
    pub fn with_resolved_params(mut self, params: serde_json::Value) -> Self {
        self.resolved_params = params;
        self
    }
}

/// Error raised when an operation name is registered twice.
#[derive(Debug, Clone, Error)]
#[error("Operation '{name}' is already registered")]
pub struct DuplicateOperationError {
    /// The duplicated name.
    pub name: String,
}

impl DuplicateOperationError {
    /// Creates a new duplicate registration error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Error produced inside an operation implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct OperationError {
    /// Human-readable message.
    pub message: String,
}

impl OperationError {
    /// Creates a new operation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for OperationError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for OperationError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A non-fatal condition raised during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineWarning {
    /// A reference could not be resolved; its text was passed through.
    UnresolvedReference {
        /// The reference text, e.g. `${env.MISSING}`.
        expression: String,
        /// Why it could not be resolved.
        reason: String,
    },
    /// A `${` marker did not parse.
    MalformedExpression {
        /// The marker text.
        text: String,
        /// Parser diagnostic.
        reason: String,
    },
    /// Nested substitution exceeded the pass limit.
    SubstitutionLimit {
        /// The partially resolved expression.
        expression: String,
        /// The configured limit.
        passes: usize,
    },
    /// A file path could not be resolved.
    PathResolution {
        /// The requested path.
        path: String,
        /// `input` or `output`.
        mode: String,
        /// Why resolution failed.
        reason: String,
    },
    /// An input path was matched by file name only.
    PathFallback {
        /// The requested path.
        requested: String,
        /// The path that was used.
        resolved: String,
    },
}

impl EngineWarning {
    /// Stable machine-readable code for this warning.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnresolvedReference { .. } => "HF-W-UNRESOLVED",
            Self::MalformedExpression { .. } => "HF-W-MALFORMED",
            Self::SubstitutionLimit { .. } => "HF-W-PASS-LIMIT",
            Self::PathResolution { .. } => "HF-W-PATH",
            Self::PathFallback { .. } => "HF-W-PATH-FALLBACK",
        }
    }

    /// Logs the warning through `tracing`.
    pub fn log(&self) {
        tracing::warn!(code = self.code(), "{}", self);
    }
}

impl fmt::Display for EngineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedReference { expression, reason } => {
                write!(f, "Unresolved reference {expression}: {reason}")
            }
            Self::MalformedExpression { text, reason } => {
                write!(f, "Malformed expression {text}: {reason}")
            }
            Self::SubstitutionLimit { expression, passes } => {
                write!(f, "Substitution limit of {passes} passes reached for '{expression}'")
            }
            Self::PathResolution { path, mode, reason } => {
                write!(f, "Could not resolve {mode} path '{path}': {reason}")
            }
            Self::PathFallback { requested, resolved } => {
                write!(
                    f,
                    "Path '{requested}' matched by file name only: using '{resolved}'"
                )
            }
        }
    }
}
