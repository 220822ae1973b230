//! Execution context: datasets, statistics, provenance and output files.

mod dataset;
mod execution;
mod provenance;

pub use dataset::{Dataset, DatasetSummary, Row};
pub use execution::{ContextDelta, ContextSnapshot, ExecutionContext};
pub use provenance::{ProvenanceLevel, ProvenanceRecord};
