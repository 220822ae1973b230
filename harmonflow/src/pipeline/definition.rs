//! Pipeline definitions as loaded from YAML or JSON.

use crate::errors::ConfigurationError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// What a failing step does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FailurePolicy {
    /// Stop the pipeline.
    #[default]
    Strict,
    /// Record a warning in provenance and continue.
    Warn,
    /// Continue without a record.
    Ignore,
}

impl FailurePolicy {
    /// Returns the policy name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Warn => "warn",
            Self::Ignore => "ignore",
        }
    }

    /// Returns true if a failure under this policy lets the run continue.
    #[must_use]
    pub const fn tolerates_failure(self) -> bool {
        !matches!(self, Self::Strict)
    }
}

impl FromStr for FailurePolicy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "warn" | "continue" => Ok(Self::Warn),
            "ignore" => Ok(Self::Ignore),
            other => Err(ConfigurationError::new(format!(
                "unknown failure policy '{other}'; expected strict, warn, continue or ignore"
            ))
            .with_field("on_failure")),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FailurePolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FailurePolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Policy for steps without their own `on_failure`.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Overrides the engine's pipeline timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

/// The operation a step invokes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Operation type name.
    #[serde(rename = "type")]
    pub operation_type: String,
    /// Unresolved parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// One step of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique step name.
    pub name: String,
    /// The operation to run.
    pub action: Action,
    /// Overrides the pipeline's failure policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailurePolicy>,
}

impl Step {
    /// Creates a step.
    #[must_use]
    pub fn new(name: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: Action {
                operation_type: operation_type.into(),
                params: Map::new(),
            },
            on_failure: None,
        }
    }

    /// Adds a raw parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.action.params.insert(name.into(), value);
        self
    }

    /// Sets the step's failure policy.
    #[must_use]
    pub fn with_on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = Some(policy);
        self
    }

    /// The operation type name.
    #[must_use]
    pub fn operation_type(&self) -> &str {
        &self.action.operation_type
    }

    /// The unresolved parameters.
    #[must_use]
    pub fn raw_params(&self) -> &Map<String, Value> {
        &self.action.params
    }

    /// The policy in effect for this step.
    #[must_use]
    pub fn effective_policy(&self, pipeline_default: FailurePolicy) -> FailurePolicy {
        self.on_failure.unwrap_or(pipeline_default)
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A named, versioned sequence of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub name: String,
    /// Pipeline version.
    #[serde(default = "default_version", deserialize_with = "version_string")]
    pub version: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Metadata, including `source_files` and `target_files` descriptors.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Unresolved top-level parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Pipeline-wide settings.
    #[serde(default)]
    pub config: PipelineConfig,
    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Accepts `version: 1.0` as well as `version: "1.0"`.
fn version_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "version must be a string or number, got {other}"
        ))),
    }
}

impl PipelineDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: String::new(),
            metadata: Map::new(),
            parameters: Map::new(),
            config: PipelineConfig::default(),
            steps: Vec::new(),
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Sets the default failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    /// Sets the pipeline timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: f64) -> Self {
        self.config.timeout_seconds = Some(seconds);
        self
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Checks structural rules.
    ///
    /// Rejects an empty name, an empty step list, empty or duplicate step
    /// names and empty operation types.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let err = |message: String, field: &str| {
            ConfigurationError::new(message)
                .with_pipeline(self.name.clone())
                .with_field(field)
        };

        if self.name.trim().is_empty() {
            return Err(err("pipeline name is empty".to_string(), "name"));
        }
        if self.steps.is_empty() {
            return Err(err(format!("pipeline '{}' has no steps", self.name), "steps"));
        }

        let mut seen = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(err(format!("step {index} has an empty name"), "steps.name"));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(err(
                    format!("duplicate step name '{}'", step.name),
                    "steps.name",
                ));
            }
            if step.action.operation_type.trim().is_empty() {
                return Err(err(
                    format!("step '{}' has an empty action type", step.name),
                    "steps.action.type",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("STRICT".parse::<FailurePolicy>().unwrap(), FailurePolicy::Strict);
        assert_eq!("continue".parse::<FailurePolicy>().unwrap(), FailurePolicy::Warn);
        assert_eq!(" Ignore ".parse::<FailurePolicy>().unwrap(), FailurePolicy::Ignore);
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn test_policy_serde_round_trip() {
        let policy: FailurePolicy = serde_json::from_value(json!("Continue")).unwrap();
        assert_eq!(policy, FailurePolicy::Warn);
        assert_eq!(serde_json::to_value(policy).unwrap(), json!("warn"));
    }

    #[test]
    fn test_effective_policy() {
        let step = Step::new("s", "ECHO");
        assert_eq!(step.effective_policy(FailurePolicy::Warn), FailurePolicy::Warn);
        let step = step.with_on_failure(FailurePolicy::Ignore);
        assert_eq!(step.effective_policy(FailurePolicy::Strict), FailurePolicy::Ignore);
    }

    #[test]
    fn test_validate_rejects_structural_errors() {
        let empty = PipelineDefinition::new("p");
        assert!(empty.validate().unwrap_err().message.contains("no steps"));

        let dup = PipelineDefinition::new("p")
            .with_step(Step::new("a", "ECHO"))
            .with_step(Step::new("a", "ECHO"));
        assert!(dup.validate().unwrap_err().message.contains("duplicate step name 'a'"));

        let blank_type = PipelineDefinition::new("p").with_step(Step::new("a", " "));
        assert_eq!(
            blank_type.validate().unwrap_err().field.as_deref(),
            Some("steps.action.type")
        );

        let unnamed = PipelineDefinition::new("").with_step(Step::new("a", "ECHO"));
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn test_numeric_version_accepted() {
        let def: PipelineDefinition = serde_json::from_value(json!({
            "name": "p",
            "version": 2.1,
            "steps": [{"name": "s", "action": {"type": "ECHO"}}],
        }))
        .unwrap();
        assert_eq!(def.version, "2.1");
        assert!(def.validate().is_ok());
    }
}
