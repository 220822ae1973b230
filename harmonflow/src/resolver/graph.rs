//! Dependency ordering among `parameters` entries.

use super::expr::{Scope, Template};
use crate::errors::CircularReferenceError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Maps each parameter to the sibling parameters it references.
///
/// References to names absent from `params` are ignored; they resolve to
/// unset at lookup time.
#[must_use]
pub fn parameter_dependencies(params: &Map<String, Value>) -> BTreeMap<String, BTreeSet<String>> {
    params
        .iter()
        .map(|(name, value)| {
            let mut deps = BTreeSet::new();
            collect_parameter_refs(value, &mut deps);
            deps.retain(|dep| params.contains_key(dep));
            (name.clone(), deps)
        })
        .collect()
}

fn collect_parameter_refs(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for reference in Template::parse(s).references() {
                if reference.scope == Scope::Parameters {
                    if let Some(key) = reference.root_key() {
                        out.insert(key.to_string());
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_parameter_refs(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_parameter_refs(v, out)),
        _ => {}
    }
}

/// Returns parameter names in an order where every parameter follows the
/// parameters it references.
///
/// Names are visited in sorted order so the result is deterministic. A cycle,
/// including a parameter referencing itself, yields the full chain.
pub fn resolution_order(params: &Map<String, Value>) -> Result<Vec<String>, CircularReferenceError> {
    let graph = parameter_dependencies(params);
    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    let mut order = Vec::with_capacity(graph.len());
    let mut path = Vec::new();

    fn dfs(
        node: &str,
        graph: &BTreeMap<String, BTreeSet<String>>,
        visited: &mut HashSet<String>,
        in_stack: &mut HashSet<String>,
        order: &mut Vec<String>,
        path: &mut Vec<String>,
    ) -> Result<(), Vec<String>> {
        if in_stack.contains(node) {
            let start = path.iter().position(|n| n == node).unwrap_or(0);
            let mut chain = path[start..].to_vec();
            chain.push(node.to_string());
            return Err(chain);
        }
        if visited.contains(node) {
            return Ok(());
        }

        visited.insert(node.to_string());
        in_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(deps) = graph.get(node) {
            for dep in deps {
                dfs(dep, graph, visited, in_stack, order, path)?;
            }
        }

        in_stack.remove(node);
        path.pop();
        order.push(node.to_string());
        Ok(())
    }

    for node in graph.keys() {
        dfs(node, &graph, &mut visited, &mut in_stack, &mut order, &mut path)
            .map_err(CircularReferenceError::new)?;
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_dependencies_ignore_unknown_names() {
        let deps = parameter_dependencies(&params(json!({
            "a": "${parameters.b}/${parameters.missing}",
            "b": "/data",
        })));

        assert_eq!(deps["a"], BTreeSet::from(["b".to_string()]));
        assert!(deps["b"].is_empty());
    }

    #[test]
    fn test_order_puts_dependencies_first() {
        let order = resolution_order(&params(json!({
            "a": "${parameters.b}/x",
            "b": "${parameters.c}",
            "c": "/root",
            "d": 1,
        })))
        .unwrap();

        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_nested_values_contribute_dependencies() {
        let deps = parameter_dependencies(&params(json!({
            "cfg": {"paths": ["${parameters.root}/a"]},
            "root": "/r",
        })));
        assert_eq!(deps["cfg"], BTreeSet::from(["root".to_string()]));
    }

    #[test]
    fn test_cycle_names_every_node() {
        let err = resolution_order(&params(json!({
            "a": "${parameters.b}",
            "b": "${parameters.c}",
            "c": "${parameters.a}",
        })))
        .unwrap_err();

        assert_eq!(err.chain, vec!["a", "b", "c", "a"]);
        assert_eq!(err.nodes(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = resolution_order(&params(json!({"a": "x${parameters.a}"}))).unwrap_err();
        assert_eq!(err.chain, vec!["a", "a"]);
    }
}
