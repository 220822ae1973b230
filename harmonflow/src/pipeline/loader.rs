//! Parsing pipeline definition documents.
//!
//! `${...}` references are left untouched here; they are resolved per run.

use super::definition::PipelineDefinition;
use crate::errors::ConfigurationError;
use std::path::Path;

/// Parses and validates a YAML pipeline definition.
pub fn from_yaml_str(source: &str) -> Result<PipelineDefinition, ConfigurationError> {
    let definition: PipelineDefinition = serde_yaml::from_str(source)
        .map_err(|e| ConfigurationError::new(format!("failed to parse pipeline YAML: {e}")))?;
    definition.validate()?;
    Ok(definition)
}

/// Parses and validates a JSON pipeline definition.
pub fn from_json_str(source: &str) -> Result<PipelineDefinition, ConfigurationError> {
    let definition: PipelineDefinition = serde_json::from_str(source)
        .map_err(|e| ConfigurationError::new(format!("failed to parse pipeline JSON: {e}")))?;
    definition.validate()?;
    Ok(definition)
}

/// Loads a pipeline definition file; `.json` is parsed as JSON, anything
/// else as YAML.
pub fn load_file(path: &Path) -> Result<PipelineDefinition, ConfigurationError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ConfigurationError::new(format!(
            "failed to read pipeline file {}: {e}",
            path.display()
        ))
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        from_json_str(&content)
    } else {
        from_yaml_str(&content)
    }
}
