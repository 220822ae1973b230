//! Test assertions for pipeline outcomes.

use crate::pipeline::{PipelineOutcome, RunStatus, StepFailureKind};
use serde_json::Value;

/// Asserts that the run completed.
pub fn assert_completed(outcome: &PipelineOutcome) {
    assert_eq!(
        outcome.status,
        RunStatus::Completed,
        "Expected completed run, got failure: {:?}",
        outcome.failure
    );
}

/// Asserts that the run failed at `step_name`.
pub fn assert_failed_at(outcome: &PipelineOutcome, step_name: &str) {
    assert_eq!(outcome.status, RunStatus::Failed, "Expected failed run");
    let failure = outcome
        .failure
        .as_ref()
        .unwrap_or_else(|| panic!("Failed run without a failure record"));
    assert_eq!(failure.step_name, step_name, "Failed at unexpected step");
}

/// Asserts that the run failed with the given kind.
pub fn assert_failure_kind(outcome: &PipelineOutcome, kind: StepFailureKind) {
    let actual = outcome.failure.as_ref().map(|f| f.kind);
    assert_eq!(actual, Some(kind), "Unexpected failure kind");
}

/// Asserts the provenance sources, in order.
pub fn assert_provenance_sources(outcome: &PipelineOutcome, expected: &[&str]) {
    let sources: Vec<&str> = outcome
        .context
        .provenance()
        .iter()
        .map(|r| r.source.as_str())
        .collect();
    assert_eq!(sources, expected, "Unexpected provenance sources");
}

/// Asserts that no string inside `value` still contains a `${` marker.
pub fn assert_no_markers(value: &Value) {
    match value {
        Value::String(s) => assert!(!s.contains("${"), "Unresolved marker in {s:?}"),
        Value::Array(items) => items.iter().for_each(assert_no_markers),
        Value::Object(map) => map.values().for_each(assert_no_markers),
        _ => {}
    }
}
