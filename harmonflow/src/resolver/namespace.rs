//! The layered namespace references are resolved against.

use super::expr::{Reference, Scope, Segment};
use crate::config::EnvSource;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Result of looking a reference up.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The reference has a value.
    Found(Value),
    /// A key or index along the path is missing. Not an error.
    Unset(String),
    /// The reference cannot be resolved at all; its text is passed through.
    Unresolved(String),
}

/// Values visible to `${...}` references.
///
/// Step-time scopes (`statistics`, `datasets`, `outputs`) are empty until the
/// executor fills them from the execution context before each step.
#[derive(Debug, Clone)]
pub struct Namespace {
    env: Arc<dyn EnvSource>,
    env_defaults: HashMap<String, String>,
    parameters: Map<String, Value>,
    metadata: Map<String, Value>,
    builtins: Map<String, Value>,
    statistics: Map<String, Value>,
    datasets: Map<String, Value>,
    outputs: Map<String, Value>,
}

impl Namespace {
    /// Creates a namespace reading the given environment.
    #[must_use]
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            env,
            env_defaults: HashMap::new(),
            parameters: Map::new(),
            metadata: Map::new(),
            builtins: Map::new(),
            statistics: Map::new(),
            datasets: Map::new(),
            outputs: Map::new(),
        }
    }

    /// Sets the fallback table for unset environment variables.
    #[must_use]
    pub fn with_env_defaults(mut self, defaults: HashMap<String, String>) -> Self {
        self.env_defaults = defaults;
        self
    }

    /// Sets the parameters scope.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Sets the metadata scope.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Adds a built-in value.
    #[must_use]
    pub fn with_builtin(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.builtins.insert(name.into(), value.into());
        self
    }

    /// Replaces the parameters scope.
    pub fn set_parameters(&mut self, parameters: Map<String, Value>) {
        self.parameters = parameters;
    }

    /// Inserts one resolved parameter.
    pub fn insert_parameter(&mut self, name: impl Into<String>, value: Value) {
        self.parameters.insert(name.into(), value);
    }

    /// Replaces the metadata scope.
    pub fn set_metadata(&mut self, metadata: Map<String, Value>) {
        self.metadata = metadata;
    }

    /// Replaces the step-time scopes.
    pub fn set_step_scopes(
        &mut self,
        statistics: Map<String, Value>,
        datasets: Map<String, Value>,
        outputs: Map<String, Value>,
    ) {
        self.statistics = statistics;
        self.datasets = datasets;
        self.outputs = outputs;
    }

    /// The parameters scope.
    #[must_use]
    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    /// The metadata scope.
    #[must_use]
    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// Looks up a reference.
    #[must_use]
    pub fn lookup(&self, reference: &Reference) -> Lookup {
        let root = match reference.scope {
            Scope::Env => return self.lookup_env(reference),
            Scope::Parameters => &self.parameters,
            Scope::Metadata => &self.metadata,
            Scope::Builtin => &self.builtins,
            Scope::Statistics => &self.statistics,
            Scope::Datasets => &self.datasets,
            Scope::Outputs => &self.outputs,
        };

        let Some(first) = reference.root_key() else {
            return Lookup::Unresolved("path must start with a name".to_string());
        };
        let Some(mut current) = root.get(first) else {
            if reference.scope == Scope::Builtin {
                return Lookup::Unresolved(format!("unknown builtin '{first}'"));
            }
            return Lookup::Unset(format!("'{first}' is not defined"));
        };

        for segment in &reference.path[1..] {
            let next = match (segment, current) {
                (Segment::Key(k), Value::Object(map)) => map.get(k),
                (Segment::Index(i), Value::Array(items)) => items.get(*i),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Lookup::Unset(format!("'{segment}' is missing")),
            }
        }

        Lookup::Found(current.clone())
    }

    fn lookup_env(&self, reference: &Reference) -> Lookup {
        let (Some(name), 1) = (reference.root_key(), reference.path.len()) else {
            return Lookup::Unresolved("environment references take a single name".to_string());
        };
        if let Some(value) = self.env.get(name) {
            return Lookup::Found(Value::String(value));
        }
        if let Some(value) = self.env_defaults.get(name) {
            return Lookup::Found(Value::String(value.clone()));
        }
        Lookup::Unresolved(format!("environment variable '{name}' is not set and has no default"))
    }
}
