//! Provenance records: the append-only audit trail of a run.

use crate::errors::EngineWarning;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a provenance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvenanceLevel {
    /// A normal effect.
    #[default]
    Info,
    /// A tolerated failure or a resolution warning.
    Warning,
}

/// One entry in the provenance trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// The step name, or `parameters`/`metadata` for pre-run resolution.
    pub source: String,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    #[serde(default)]
    pub level: ProvenanceLevel,
    /// Free-form detail.
    pub detail: Value,
}

impl ProvenanceRecord {
    /// Creates an info record stamped now.
    #[must_use]
    pub fn new(source: impl Into<String>, detail: Value) -> Self {
        Self {
            source: source.into(),
            timestamp: Utc::now(),
            level: ProvenanceLevel::Info,
            detail,
        }
    }

    /// Creates a warning record stamped now.
    #[must_use]
    pub fn warning(source: impl Into<String>, detail: Value) -> Self {
        Self {
            level: ProvenanceLevel::Warning,
            ..Self::new(source, detail)
        }
    }

    /// Creates a warning record listing resolution warnings.
    #[must_use]
    pub fn from_warnings(source: impl Into<String>, warnings: &[EngineWarning]) -> Self {
        Self::warning(
            source,
            serde_json::json!({ "warnings": warnings }),
        )
    }

    /// Returns true for warning records.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.level == ProvenanceLevel::Warning
    }
}
