//! Operation input schemas and parameter validation.

use crate::errors::{EngineWarning, ParameterValidationError};
use crate::paths::{PathMode, PathResolver};
use crate::resolver::Coercion;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Expected type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    /// Any value.
    Any,
    /// A string, never coerced.
    String,
    /// A whole number.
    Integer,
    /// Any number.
    Float,
    /// A boolean.
    Boolean,
    /// An array.
    List,
    /// An object.
    Object,
    /// A file path, never coerced and resolved through the path resolver.
    Path(PathMode),
}

impl ParamKind {
    /// Returns the kind name used in messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::List => "list",
            Self::Object => "object",
            Self::Path(PathMode::Input) => "input path",
            Self::Path(PathMode::Output) => "output path",
        }
    }

    /// Whether resolved strings for this kind are coerced.
    #[must_use]
    pub const fn coercion(self) -> Coercion {
        match self {
            Self::String | Self::Path(_) => Coercion::Disabled,
            _ => Coercion::Enabled,
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String | Self::Path(_) => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Declaration of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Expected type.
    pub kind: ParamKind,
    /// Whether the parameter must be present.
    pub required: bool,
    /// Value used when the parameter is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ParamSpec {
    /// Declares a required parameter.
    #[must_use]
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            default: None,
            description: String::new(),
        }
    }

    /// Declares an optional parameter.
    #[must_use]
    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A region of the execution context an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSlot {
    /// Named datasets.
    Datasets,
    /// Running statistics.
    Statistics,
    /// Emitted output files.
    OutputFiles,
}

/// Input contract of an operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationSchema {
    /// Declared parameters.
    pub params: Vec<ParamSpec>,
    /// Context slots read.
    pub reads: Vec<ContextSlot>,
    /// Context slots written.
    pub writes: Vec<ContextSlot>,
    /// Accept parameters that are not declared.
    pub allow_unknown: bool,
}

/// Validated parameters plus warnings raised by path resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedParams {
    /// The parameters, with defaults applied and paths resolved.
    pub params: ResolvedParams,
    /// Path resolution warnings.
    pub warnings: Vec<EngineWarning>,
}

impl OperationSchema {
    /// Creates an empty schema that rejects unknown parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a schema that accepts any parameters.
    #[must_use]
    pub fn open() -> Self {
        Self {
            allow_unknown: true,
            ..Self::default()
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Declares a slot read.
    #[must_use]
    pub fn reads(mut self, slot: ContextSlot) -> Self {
        self.reads.push(slot);
        self
    }

    /// Declares a slot written.
    #[must_use]
    pub fn writes(mut self, slot: ContextSlot) -> Self {
        self.writes.push(slot);
        self
    }

    /// Looks up a parameter declaration.
    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Coercion mode for one parameter; undeclared parameters are coerced.
    #[must_use]
    pub fn coercion_for(&self, name: &str) -> Coercion {
        self.spec(name).map_or(Coercion::Enabled, |spec| spec.kind.coercion())
    }

    /// Validates resolved parameters.
    ///
    /// Applies defaults, checks presence and types, and resolves path
    /// parameters. A `null` value counts as absent. Every violation is
    /// collected into one error.
    pub fn validate(
        &self,
        operation_type: &str,
        mut params: Map<String, Value>,
        paths: &PathResolver,
    ) -> Result<ValidatedParams, ParameterValidationError> {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        if !self.allow_unknown {
            for key in params.keys() {
                if self.spec(key).is_none() {
                    violations.push(format!("unknown parameter '{key}'"));
                }
            }
        }

        for spec in &self.params {
            let present = params.get(&spec.name).is_some_and(|v| !v.is_null());
            if !present {
                match (&spec.default, spec.required) {
                    (Some(default), _) => {
                        params.insert(spec.name.clone(), default.clone());
                    }
                    (None, true) => {
                        violations.push(format!("missing required parameter '{}'", spec.name));
                        continue;
                    }
                    (None, false) => {
                        params.remove(&spec.name);
                        continue;
                    }
                }
            }

            let Some(value) = params.get_mut(&spec.name) else { continue };
            if !spec.kind.accepts(value) {
                violations.push(format!(
                    "parameter '{}' must be {}, got {}",
                    spec.name,
                    spec.kind.name(),
                    type_name(value)
                ));
                continue;
            }

            if let ParamKind::Path(mode) = spec.kind {
                if let Some(raw) = value.as_str() {
                    let resolved = paths.resolve(raw, mode);
                    if let Some(warning) = resolved.warning {
                        warnings.push(warning);
                    }
                    *value = Value::String(resolved.path.display().to_string());
                }
            }
        }

        if violations.is_empty() {
            Ok(ValidatedParams {
                params: ResolvedParams::new(params),
                warnings,
            })
        } else {
            Err(ParameterValidationError::new(operation_type, violations))
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Concrete parameters for one step invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedParams(Map<String, Value>);

impl ResolvedParams {
    /// Wraps a map.
    #[must_use]
    pub fn new(params: Map<String, Value>) -> Self {
        Self(params)
    }

    /// Gets a raw value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Gets a string.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Gets an integer.
    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    /// Gets a number.
    #[must_use]
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    /// Gets a boolean.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    /// Gets a list of strings; a single string becomes a one-element list.
    #[must_use]
    pub fn get_str_list(&self, name: &str) -> Option<Vec<String>> {
        match self.0.get(name)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
                    .collect(),
            ),
            Value::String(s) => Some(vec![s.clone()]),
            _ => None,
        }
    }

    /// Gets a path.
    #[must_use]
    pub fn get_path(&self, name: &str) -> Option<PathBuf> {
        self.get_str(name).map(PathBuf::from)
    }

    /// The underlying map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts into the underlying map.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// The parameters as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn resolver(dir: &TempDir) -> PathResolver {
        PathResolver::new(dir.path(), vec![dir.path().join("data")], dir.path().join("out"))
    }

    fn schema() -> OperationSchema {
        OperationSchema::new()
            .param(ParamSpec::required("input_key", ParamKind::String))
            .param(ParamSpec::optional("limit", ParamKind::Integer).with_default(json!(100)))
            .param(ParamSpec::optional("verbose", ParamKind::Boolean))
    }

    #[test]
    fn test_defaults_applied() {
        let dir = TempDir::new().unwrap();
        let validated = schema()
            .validate("OP", map(json!({"input_key": "m"})), &resolver(&dir))
            .unwrap();

        assert_eq!(validated.params.get_i64("limit"), Some(100));
        assert_eq!(validated.params.get_bool("verbose"), None);
    }

    #[test]
    fn test_all_violations_collected() {
        let dir = TempDir::new().unwrap();
        let err = schema()
            .validate(
                "OP",
                map(json!({"limit": "many", "extra": 1})),
                &resolver(&dir),
            )
            .unwrap_err();

        assert_eq!(err.violations.len(), 3);
        assert!(err.violations.iter().any(|v| v.contains("missing required parameter 'input_key'")));
        assert!(err.violations.iter().any(|v| v.contains("must be integer, got string")));
        assert!(err.violations.iter().any(|v| v.contains("unknown parameter 'extra'")));
    }

    #[test]
    fn test_null_counts_as_missing() {
        let dir = TempDir::new().unwrap();
        let err = schema()
            .validate("OP", map(json!({"input_key": null})), &resolver(&dir))
            .unwrap_err();
        assert_eq!(err.violations, vec!["missing required parameter 'input_key'"]);
    }

    #[test]
    fn test_output_path_is_rooted() {
        let dir = TempDir::new().unwrap();
        let schema = OperationSchema::new()
            .param(ParamSpec::required("dest", ParamKind::Path(PathMode::Output)));

        let validated = schema
            .validate("OP", map(json!({"dest": "r/out.json"})), &resolver(&dir))
            .unwrap();

        assert_eq!(
            validated.params.get_path("dest").unwrap(),
            dir.path().join("out/r/out.json")
        );
    }

    #[test]
    fn test_missing_input_path_warns() {
        let dir = TempDir::new().unwrap();
        let schema = OperationSchema::new()
            .param(ParamSpec::required("src", ParamKind::Path(PathMode::Input)));

        let validated = schema
            .validate("OP", map(json!({"src": "absent.csv"})), &resolver(&dir))
            .unwrap();
        assert_eq!(validated.warnings.len(), 1);
    }

    #[test]
    fn test_coercion_per_kind() {
        let schema = schema();
        assert_eq!(schema.coercion_for("input_key"), Coercion::Disabled);
        assert_eq!(schema.coercion_for("limit"), Coercion::Enabled);
        assert_eq!(schema.coercion_for("undeclared"), Coercion::Enabled);
    }

    #[test]
    fn test_open_schema_accepts_anything() {
        let dir = TempDir::new().unwrap();
        let validated = OperationSchema::open()
            .validate("ECHO", map(json!({"v": 1})), &resolver(&dir))
            .unwrap();
        assert_eq!(validated.params.get_i64("v"), Some(1));
    }

    #[test]
    fn test_str_list_accepts_single_string() {
        let params = ResolvedParams::new(map(json!({"a": "x", "b": ["y", 2]})));
        assert_eq!(params.get_str_list("a"), Some(vec!["x".to_string()]));
        assert_eq!(params.get_str_list("b"), Some(vec!["y".to_string(), "2".to_string()]));
    }
}
