//! Expression resolution.
//!
//! Substitutes `${scope.path}` references inside parameter values, orders
//! parameters by their references to each other, and coerces fully resolved
//! strings into typed values.
//!
//! Resolution never fails on a bad reference. Unresolvable references are
//! passed through as text and reported as [`EngineWarning`]s; the only fatal
//! condition is a parameter cycle.

pub mod coerce;
pub mod expr;
pub mod graph;
pub mod namespace;


pub use coerce::{coerce_str, coerce_value};
pub use expr::{Piece, Reference, Scope, Segment, Template};
pub use graph::{parameter_dependencies, resolution_order};
pub use namespace::{Lookup, Namespace};

use crate::errors::{CircularReferenceError, EngineWarning};
use serde_json::{Map, Value};
use tracing::debug;

/// Whether fully resolved strings are type-coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Apply the coercion rules.
    Enabled,
    /// Keep strings as strings.
    Disabled,
}

/// A resolved value plus the warnings raised while resolving it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// The resolved value.
    pub value: Value,
    /// Non-fatal conditions, without duplicates.
    pub warnings: Vec<EngineWarning>,
}

/// A resolved map plus the warnings raised while resolving it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedMap {
    /// The resolved entries.
    pub values: Map<String, Value>,
    /// Non-fatal conditions, without duplicates.
    pub warnings: Vec<EngineWarning>,
}

/// Resolves `${...}` references against a [`Namespace`].
#[derive(Debug, Clone)]
pub struct ExpressionResolver {
    max_passes: usize,
}

impl Default for ExpressionResolver {
    fn default() -> Self {
        Self { max_passes: 10 }
    }
}

impl ExpressionResolver {
    /// Creates a resolver with the given nested substitution limit.
    #[must_use]
    pub fn new(max_passes: usize) -> Self {
        Self {
            max_passes: max_passes.max(1),
        }
    }

    /// The nested substitution limit.
    #[must_use]
    pub fn max_passes(&self) -> usize {
        self.max_passes
    }

    /// Resolves a value with coercion enabled.
    #[must_use]
    pub fn resolve(&self, raw: &Value, namespace: &Namespace) -> Resolved {
        self.resolve_with(raw, namespace, Coercion::Enabled)
    }

    /// Resolves a value.
    #[must_use]
    pub fn resolve_with(&self, raw: &Value, namespace: &Namespace, coercion: Coercion) -> Resolved {
        let mut warnings = Vec::new();
        let value = self.resolve_value(raw, namespace, coercion, 0, &mut warnings);
        Resolved { value, warnings }
    }

    /// Resolves a `parameters` block in dependency order.
    ///
    /// Invocation parameters replace definition parameters of the same name.
    /// Each resolved parameter is written into `namespace` before the next is
    /// resolved.
    pub fn resolve_parameters(
        &self,
        definition: &Map<String, Value>,
        invocation: &Map<String, Value>,
        namespace: &mut Namespace,
    ) -> Result<ResolvedMap, CircularReferenceError> {
        let mut merged = definition.clone();
        for (name, value) in invocation {
            merged.insert(name.clone(), value.clone());
        }

        let order = resolution_order(&merged)?;
        namespace.set_parameters(Map::new());

        let mut resolved = ResolvedMap::default();
        for name in order {
            let Some(raw) = merged.get(&name) else { continue };
            let value =
                self.resolve_value(raw, namespace, Coercion::Enabled, 0, &mut resolved.warnings);
            namespace.insert_parameter(name.clone(), value.clone());
            resolved.values.insert(name, value);
        }

        debug!(
            parameters = resolved.values.len(),
            warnings = resolved.warnings.len(),
            "Resolved parameters"
        );
        Ok(resolved)
    }

    /// Resolves a `metadata` block and installs the result in `namespace`.
    ///
    /// Metadata may reference parameters, the environment and itself. Strings
    /// are not coerced: metadata holds descriptors, not settings.
    pub fn resolve_metadata(
        &self,
        raw: &Map<String, Value>,
        namespace: &mut Namespace,
    ) -> ResolvedMap {
        namespace.set_metadata(raw.clone());

        let mut resolved = ResolvedMap::default();
        for (key, value) in raw {
            let value =
                self.resolve_value(value, namespace, Coercion::Disabled, 0, &mut resolved.warnings);
            resolved.values.insert(key.clone(), value);
        }

        namespace.set_metadata(resolved.values.clone());
        resolved
    }

    fn resolve_value(
        &self,
        raw: &Value,
        namespace: &Namespace,
        coercion: Coercion,
        depth: usize,
        warnings: &mut Vec<EngineWarning>,
    ) -> Value {
        match raw {
            Value::String(s) => self.resolve_string(s, namespace, coercion, depth, warnings),
            // List elements are never coerced, so "1,2" -> ["1", "2"] stays put
            // when resolved again.
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.resolve_value(v, namespace, Coercion::Disabled, depth, warnings))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        (k.clone(), self.resolve_value(v, namespace, coercion, depth, warnings))
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_string(
        &self,
        raw: &str,
        namespace: &Namespace,
        coercion: Coercion,
        depth: usize,
        warnings: &mut Vec<EngineWarning>,
    ) -> Value {
        let template = Template::parse(raw);
        if !template.has_markers() {
            return apply(coercion, raw);
        }

        if depth >= self.max_passes {
            push_warning(
                warnings,
                EngineWarning::SubstitutionLimit {
                    expression: raw.to_string(),
                    passes: self.max_passes,
                },
            );
            return Value::String(raw.to_string());
        }

        if let Some(reference) = template.single_reference() {
            return match namespace.lookup(reference) {
                Lookup::Found(value) => {
                    self.resolve_value(&value, namespace, coercion, depth + 1, warnings)
                }
                Lookup::Unset(reason) => {
                    debug!(reference = %reference, reason = %reason, "Reference is unset");
                    Value::Null
                }
                Lookup::Unresolved(reason) => {
                    push_warning(
                        warnings,
                        EngineWarning::UnresolvedReference {
                            expression: reference.source.clone(),
                            reason,
                        },
                    );
                    Value::String(raw.to_string())
                }
            };
        }

        let mut out = String::with_capacity(raw.len());
        let mut clean = true;
        for piece in template.pieces() {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Malformed { text, reason } => {
                    clean = false;
                    out.push_str(text);
                    push_warning(
                        warnings,
                        EngineWarning::MalformedExpression {
                            text: text.clone(),
                            reason: reason.clone(),
                        },
                    );
                }
                Piece::Reference(reference) => match namespace.lookup(reference) {
                    Lookup::Found(value) => {
                        let value = self.resolve_value(
                            &value,
                            namespace,
                            Coercion::Disabled,
                            depth + 1,
                            warnings,
                        );
                        let rendered = render(&value);
                        if rendered.contains("${") {
                            clean = false;
                        }
                        out.push_str(&rendered);
                    }
                    Lookup::Unset(reason) | Lookup::Unresolved(reason) => {
                        clean = false;
                        out.push_str(&reference.source);
                        push_warning(
                            warnings,
                            EngineWarning::UnresolvedReference {
                                expression: reference.source.clone(),
                                reason,
                            },
                        );
                    }
                },
            }
        }

        if clean {
            apply(coercion, &out)
        } else {
            Value::String(out)
        }
    }
}

/// Renders a value for embedding in a larger string.
#[must_use]
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn apply(coercion: Coercion, text: &str) -> Value {
    match coercion {
        Coercion::Enabled => coerce_str(text),
        Coercion::Disabled => Value::String(text.to_string()),
    }
}

fn push_warning(warnings: &mut Vec<EngineWarning>, warning: EngineWarning) {
    if !warnings.contains(&warning) {
        warning.log();
        warnings.push(warning);
    }
}
