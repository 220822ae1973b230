//! Generic operations every registry starts with.
//!
//! Domain operations (identifier extraction, matching, external lookups)
//! live outside the engine and register alongside these.

use super::{
    ContextSlot, Operation, OperationResult, OperationSchema, ParamKind, ParamSpec,
    ResolvedParams, StepContext,
};
use crate::batch::{ChunkConfig, ChunkedOperation, DatasetOperation};
use crate::context::{ContextDelta, Dataset};
use crate::errors::{DuplicateOperationError, OperationError};
use crate::paths::PathMode;
use crate::registry::OperationRegistry;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Name of [`EchoOperation`].
pub const ECHO: &str = "ECHO";
/// Name of [`InlineDatasetOperation`].
pub const INLINE_DATASET: &str = "INLINE_DATASET";
/// Name of the chunked [`NormalizeColumn`] operation.
pub const NORMALIZE_COLUMN: &str = "NORMALIZE_COLUMN";
/// Name of [`ExportDatasetOperation`].
pub const EXPORT_DATASET: &str = "EXPORT_DATASET";

/// Registers every built-in operation.
pub fn register_builtins(registry: &mut OperationRegistry) -> Result<(), DuplicateOperationError> {
    registry.register(ECHO, Arc::new(|| Arc::new(EchoOperation) as Arc<dyn Operation>))?;
    registry.register(
        INLINE_DATASET,
        Arc::new(|| Arc::new(InlineDatasetOperation) as Arc<dyn Operation>),
    )?;
    registry.register(
        NORMALIZE_COLUMN,
        Arc::new(|| {
            Arc::new(ChunkedOperation::new(NormalizeColumn, ChunkConfig::default()))
                as Arc<dyn Operation>
        }),
    )?;
    registry.register(
        EXPORT_DATASET,
        Arc::new(|| Arc::new(ExportDatasetOperation) as Arc<dyn Operation>),
    )?;
    Ok(())
}

/// Returns its parameters as the summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoOperation;

#[async_trait]
impl Operation for EchoOperation {
    fn schema(&self) -> OperationSchema {
        OperationSchema::open()
    }

    async fn execute(&self, params: &ResolvedParams, _step: &StepContext<'_>) -> OperationResult {
        OperationResult {
            success: true,
            summary: params.as_map().clone(),
            ..OperationResult::default()
        }
    }
}

/// Builds a dataset from rows written in the pipeline definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDatasetOperation;

#[async_trait]
impl Operation for InlineDatasetOperation {
    fn schema(&self) -> OperationSchema {
        OperationSchema::new()
            .param(ParamSpec::required("output_key", ParamKind::String))
            .param(ParamSpec::required("rows", ParamKind::List).with_description("Array of row objects"))
            .writes(ContextSlot::Datasets)
    }

    async fn execute(&self, params: &ResolvedParams, _step: &StepContext<'_>) -> OperationResult {
        let Some(output_key) = params.get_str("output_key") else {
            return OperationResult::fail("missing 'output_key'");
        };
        let Some(dataset) = params.get("rows").and_then(Dataset::from_json) else {
            return OperationResult::fail("'rows' must be a list of objects");
        };

        OperationResult::ok()
            .with_summary("output_key", json!(output_key))
            .with_summary("rows", json!(dataset.len()))
            .with_summary("columns", json!(dataset.columns()))
            .with_changes(ContextDelta::new().with_dataset(output_key, dataset))
    }
}

/// Normalizes one identifier column: trims, strips known prefixes and
/// changes case.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeColumn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaseMode {
    Upper,
    Lower,
    Keep,
}

impl NormalizeColumn {
    fn normalize(value: &str, trim: bool, prefixes: &[String], case: CaseMode) -> String {
        let mut out = if trim { value.trim() } else { value };
        let lowered = out.to_ascii_lowercase();
        if let Some(prefix) = prefixes
            .iter()
            .find(|p| !p.is_empty() && lowered.starts_with(&p.to_ascii_lowercase()))
        {
            out = &out[prefix.len()..];
            if trim {
                out = out.trim_start();
            }
        }
        match case {
            CaseMode::Upper => out.to_uppercase(),
            CaseMode::Lower => out.to_lowercase(),
            CaseMode::Keep => out.to_string(),
        }
    }
}

#[async_trait]
impl DatasetOperation for NormalizeColumn {
    fn schema(&self) -> OperationSchema {
        OperationSchema::new()
            .param(ParamSpec::required("column", ParamKind::String))
            .param(ParamSpec::optional("trim", ParamKind::Boolean).with_default(json!(true)))
            .param(
                ParamSpec::optional("case", ParamKind::String)
                    .with_default(json!("keep"))
                    .with_description("upper, lower or keep"),
            )
            .param(
                ParamSpec::optional("strip_prefixes", ParamKind::Any)
                    .with_description("Prefix or list of prefixes removed case-insensitively"),
            )
    }

    async fn apply(
        &self,
        params: &ResolvedParams,
        input: Dataset,
    ) -> Result<Dataset, OperationError> {
        let column = params
            .get_str("column")
            .ok_or_else(|| OperationError::new("missing 'column'"))?;
        if !input.is_empty() && !input.has_column(column) {
            return Err(OperationError::new(format!("column '{column}' not found")));
        }
        let trim = params.get_bool("trim").unwrap_or(true);
        let case = match params.get_str("case").unwrap_or("keep").to_ascii_lowercase().as_str() {
            "upper" => CaseMode::Upper,
            "lower" => CaseMode::Lower,
            "keep" | "none" => CaseMode::Keep,
            other => return Err(OperationError::new(format!("unknown case mode '{other}'"))),
        };
        let prefixes = params.get_str_list("strip_prefixes").unwrap_or_default();

        let mut output = Dataset::new(input.columns().to_vec());
        for row in input.rows() {
            let mut row = row.clone();
            if let Some(Value::String(s)) = row.get(column) {
                let normalized = Self::normalize(s, trim, &prefixes, case);
                row.insert(column.to_string(), Value::String(normalized));
            }
            output.push_row(row);
        }
        Ok(output)
    }
}

/// Writes a dataset to a JSON file under the output directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportDatasetOperation;

#[async_trait]
impl Operation for ExportDatasetOperation {
    fn schema(&self) -> OperationSchema {
        OperationSchema::new()
            .param(ParamSpec::required("input_key", ParamKind::String))
            .param(ParamSpec::required("path", ParamKind::Path(PathMode::Output)))
            .param(ParamSpec::optional("output_name", ParamKind::String))
            .param(ParamSpec::optional("pretty", ParamKind::Boolean).with_default(json!(false)))
            .reads(ContextSlot::Datasets)
            .writes(ContextSlot::OutputFiles)
    }

    async fn execute(&self, params: &ResolvedParams, step: &StepContext<'_>) -> OperationResult {
        match export(params, step).await {
            Ok(result) => result,
            Err(err) => err.into(),
        }
    }
}

async fn export(
    params: &ResolvedParams,
    step: &StepContext<'_>,
) -> Result<OperationResult, OperationError> {
    let input_key = params
        .get_str("input_key")
        .ok_or_else(|| OperationError::new("missing 'input_key'"))?;
    let path = params
        .get_path("path")
        .ok_or_else(|| OperationError::new("missing 'path'"))?;
    let output_name = params.get_str("output_name").unwrap_or(input_key);
    let dataset = step.require_dataset(input_key)?;

    let body = if params.get_bool("pretty").unwrap_or(false) {
        serde_json::to_vec_pretty(&dataset.to_json())?
    } else {
        serde_json::to_vec(&dataset.to_json())?
    };
    tokio::fs::write(&path, &body).await?;

    info!(
        step = %step.step_name,
        path = %path.display(),
        rows = dataset.len(),
        "Exported dataset"
    );

    Ok(OperationResult::ok()
        .with_summary("path", json!(path.display().to_string()))
        .with_summary("rows", json!(dataset.len()))
        .with_summary("bytes", json!(body.len()))
        .with_changes(ContextDelta::new().with_output_file(output_name, path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::paths::PathResolver;
    use pretty_assertions::assert_eq;
    use serde_json::Map;

    fn params(value: Value) -> ResolvedParams {
        ResolvedParams::new(value.as_object().cloned().unwrap_or_else(Map::new))
    }

    fn step<'a>(context: &'a ExecutionContext, paths: &'a PathResolver) -> StepContext<'a> {
        StepContext {
            run_id: "r",
            step_name: "s",
            operation_type: "OP",
            context,
            paths,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_echo_returns_params() {
        let context = ExecutionContext::new();
        let paths = PathResolver::new(".", vec![], "out");
        let result = EchoOperation
            .execute(&params(json!({"v": "/tmp/x/f.csv"})), &step(&context, &paths))
            .await;

        assert!(result.success);
        assert_eq!(result.summary["v"], json!("/tmp/x/f.csv"));
        assert!(result.changes.is_empty());
    }

    #[tokio::test]
    async fn test_inline_dataset() {
        let context = ExecutionContext::new();
        let paths = PathResolver::new(".", vec![], "out");
        let result = InlineDatasetOperation
            .execute(
                &params(json!({"output_key": "p", "rows": [{"id": "A"}, {"id": "B"}]})),
                &step(&context, &paths),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.changes.datasets["p"].len(), 2);

        let bad = InlineDatasetOperation
            .execute(&params(json!({"output_key": "p", "rows": [1]})), &step(&context, &paths))
            .await;
        assert!(!bad.success);
    }

    #[test]
    fn test_normalize_value() {
        let prefixes = vec!["UniProtKB:".to_string()];
        assert_eq!(
            NormalizeColumn::normalize("  uniprotkb: p12345 ", true, &prefixes, CaseMode::Upper),
            "P12345"
        );
        assert_eq!(
            NormalizeColumn::normalize("HMDB0001", true, &prefixes, CaseMode::Keep),
            "HMDB0001"
        );
    }

    #[tokio::test]
    async fn test_normalize_column_through_chunking() {
        let mut context = ExecutionContext::new();
        context.set_dataset(
            "ids",
            Dataset::from_json(&json!([
                {"id": " uniprot:p1", "n": 1},
                {"id": "P2 ", "n": 2},
                {"id": 3, "n": 3},
            ]))
            .unwrap(),
        );
        let paths = PathResolver::new(".", vec![], "out");
        let op = ChunkedOperation::new(NormalizeColumn, ChunkConfig::new().with_min_rows(1));

        let result = op
            .execute(
                &params(json!({
                    "input_key": "ids",
                    "output_key": "clean",
                    "column": "id",
                    "case": "upper",
                    "strip_prefixes": "uniprot:",
                    "chunk_size": 2,
                })),
                &step(&context, &paths),
            )
            .await;

        assert!(result.success, "{:?}", result.error);
        let clean = &result.changes.datasets["clean"];
        assert_eq!(
            clean.column_values("id"),
            vec![json!("P1"), json!("P2"), json!(3)]
        );
        assert_eq!(result.summary["chunks"], json!(2));
        assert!(result.changes.statistics["chunking"]["s"].is_object());
    }

    #[tokio::test]
    async fn test_normalize_rejects_unknown_column() {
        let input = Dataset::from_json(&json!([{"id": "a"}])).unwrap();
        let err = NormalizeColumn
            .apply(&params(json!({"column": "name"})), input)
            .await
            .unwrap_err();
        assert!(err.message.contains("column 'name' not found"));
    }

    #[tokio::test]
    async fn test_export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = ExecutionContext::new();
        context.set_dataset("m", Dataset::from_json(&json!([{"id": "x"}])).unwrap());
        let paths = PathResolver::new(dir.path(), vec![], dir.path().join("out"));
        let target = dir.path().join("m.json");

        let result = ExportDatasetOperation
            .execute(
                &params(json!({"input_key": "m", "path": target.display().to_string()})),
                &step(&context, &paths),
            )
            .await;

        assert!(result.success, "{:?}", result.error);
        let written: Value = serde_json::from_slice(&std::fs::read(&target).unwrap()).unwrap();
        assert_eq!(written, json!([{"id": "x"}]));
        assert_eq!(result.changes.output_files["m"], target);
    }

    #[tokio::test]
    async fn test_export_missing_dataset_fails() {
        let context = ExecutionContext::new();
        let paths = PathResolver::new(".", vec![], "out");
        let result = ExportDatasetOperation
            .execute(
                &params(json!({"input_key": "nope", "path": "/tmp/never.json"})),
                &step(&context, &paths),
            )
            .await;
        assert!(!result.success);
        assert!(result.error_message().contains("dataset 'nope' not found"));
    }
}
