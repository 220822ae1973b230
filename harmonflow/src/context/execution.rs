//! The mutable state threaded through one pipeline run.

use super::dataset::{Dataset, DatasetSummary};
use super::provenance::ProvenanceRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// State shared by every step of a run.
///
/// The executor owns the context exclusively. Operations read it through a
/// shared reference and describe their writes as a [`ContextDelta`], which
/// the executor applies only when the step succeeds.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    datasets: HashMap<String, Arc<Dataset>>,
    statistics: Map<String, Value>,
    provenance: Vec<ProvenanceRecord>,
    output_files: BTreeMap<String, PathBuf>,
}

impl ExecutionContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a dataset by name.
    #[must_use]
    pub fn dataset(&self, name: &str) -> Option<&Arc<Dataset>> {
        self.datasets.get(name)
    }

    /// Dataset names, sorted.
    #[must_use]
    pub fn dataset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.datasets.keys().cloned().collect();
        names.sort();
        names
    }

    /// All statistics.
    #[must_use]
    pub fn statistics(&self) -> &Map<String, Value> {
        &self.statistics
    }

    /// Gets one statistic.
    #[must_use]
    pub fn statistic(&self, name: &str) -> Option<&Value> {
        self.statistics.get(name)
    }

    /// The provenance trail in append order.
    #[must_use]
    pub fn provenance(&self) -> &[ProvenanceRecord] {
        &self.provenance
    }

    /// Output files by logical name.
    #[must_use]
    pub fn output_files(&self) -> &BTreeMap<String, PathBuf> {
        &self.output_files
    }

    /// Stores a dataset, replacing any previous value under `name`.
    pub fn set_dataset(&mut self, name: impl Into<String>, dataset: impl Into<Arc<Dataset>>) {
        self.datasets.insert(name.into(), dataset.into());
    }

    /// Merges a statistic into the existing value.
    ///
    /// Objects merge key by key (recursively), arrays append, anything else
    /// replaces the old value.
    pub fn merge_statistic(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.statistics.get_mut(&name) {
            Some(existing) => merge_value(existing, value),
            None => {
                self.statistics.insert(name, value);
            }
        }
    }

    /// Records an output file.
    pub fn add_output_file(&mut self, name: impl Into<String>, path: impl Into<PathBuf>) {
        self.output_files.insert(name.into(), path.into());
    }

    /// Appends a provenance record.
    pub fn append_provenance(&mut self, record: ProvenanceRecord) {
        self.provenance.push(record);
    }

    /// Applies an operation's writes.
    pub fn apply(&mut self, delta: ContextDelta) {
        for (name, dataset) in delta.datasets {
            self.datasets.insert(name, dataset);
        }
        for (name, value) in delta.statistics {
            self.merge_statistic(name, value);
        }
        self.output_files.extend(delta.output_files);
    }

    /// Statistics as seen by `${statistics.*}` references.
    #[must_use]
    pub fn statistics_scope(&self) -> Map<String, Value> {
        self.statistics.clone()
    }

    /// Dataset summaries as seen by `${datasets.*}` references.
    #[must_use]
    pub fn datasets_scope(&self) -> Map<String, Value> {
        self.datasets
            .iter()
            .map(|(name, ds)| {
                let summary = serde_json::to_value(ds.summary()).unwrap_or(Value::Null);
                (name.clone(), summary)
            })
            .collect()
    }

    /// Output paths as seen by `${outputs.*}` references.
    #[must_use]
    pub fn outputs_scope(&self) -> Map<String, Value> {
        self.output_files
            .iter()
            .map(|(name, path)| (name.clone(), Value::String(path.display().to_string())))
            .collect()
    }

    /// Captures a serializable view of the context.
    #[must_use]
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            datasets: self
                .datasets
                .iter()
                .map(|(name, ds)| (name.clone(), ds.summary()))
                .collect(),
            statistics: self.statistics.clone(),
            provenance: self.provenance.clone(),
            output_files: self.output_files.clone(),
        }
    }
}

fn merge_value(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, value) in new {
                match old.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        old.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => old.extend(new),
        (slot, value) => *slot = value,
    }
}

/// Writes an operation wants applied to the context.
#[derive(Debug, Clone, Default)]
pub struct ContextDelta {
    /// Datasets to store.
    pub datasets: BTreeMap<String, Arc<Dataset>>,
    /// Statistics to merge.
    pub statistics: Map<String, Value>,
    /// Output files to record.
    pub output_files: BTreeMap<String, PathBuf>,
}

impl ContextDelta {
    /// Creates an empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dataset.
    #[must_use]
    pub fn with_dataset(mut self, name: impl Into<String>, dataset: impl Into<Arc<Dataset>>) -> Self {
        self.datasets.insert(name.into(), dataset.into());
        self
    }

    /// Adds a statistic.
    #[must_use]
    pub fn with_statistic(mut self, name: impl Into<String>, value: Value) -> Self {
        self.statistics.insert(name.into(), value);
        self
    }

    /// Adds an output file.
    #[must_use]
    pub fn with_output_file(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.output_files.insert(name.into(), path.into());
        self
    }

    /// Returns true if the delta writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty() && self.statistics.is_empty() && self.output_files.is_empty()
    }

    /// Names of the context slots this delta writes, for provenance.
    #[must_use]
    pub fn describe(&self) -> Value {
        serde_json::json!({
            "datasets": self.datasets.keys().collect::<Vec<_>>(),
            "statistics": self.statistics.keys().collect::<Vec<_>>(),
            "output_files": self.output_files.keys().collect::<Vec<_>>(),
        })
    }
}

/// Serializable view of an [`ExecutionContext`].
///
/// Datasets are reduced to their summaries; a checkpointing collaborator
/// stores row data separately if it needs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Dataset summaries by name.
    pub datasets: BTreeMap<String, DatasetSummary>,
    /// Statistics.
    pub statistics: Map<String, Value>,
    /// Provenance trail.
    pub provenance: Vec<ProvenanceRecord>,
    /// Output files by name.
    pub output_files: BTreeMap<String, PathBuf>,
}
