//! Chunked execution of dataset-to-dataset operations.
//!
//! [`ChunkedOperation`] splits an input dataset into pieces, runs the wrapped
//! operation on each piece (several at once, up to `max_workers`) and
//! concatenates the results in input order. Piece size shrinks while process
//! memory is above a high-water mark and grows back once it drops below half
//! of it.

use crate::context::{ContextDelta, Dataset};
use crate::errors::OperationError;
use crate::operations::{
    ContextSlot, Operation, OperationResult, OperationSchema, ParamKind, ParamSpec,
    ResolvedParams, StepContext,
};
use crate::pipeline::FailurePolicy;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An operation that maps one dataset to another.
#[async_trait]
pub trait DatasetOperation: Send + Sync + fmt::Debug {
    /// Parameters this operation reads, besides the chunking ones.
    fn schema(&self) -> OperationSchema {
        OperationSchema::new()
    }

    /// Transforms one piece of the input.
    async fn apply(&self, params: &ResolvedParams, input: Dataset)
        -> Result<Dataset, OperationError>;
}

/// Reports the process's resident memory.
#[cfg_attr(test, mockall::automock)]
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in bytes, if it can be measured.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads resident memory from `/proc/self/statm`.
///
/// Returns `None` on platforms without procfs, which turns adaptation off.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemoryProbe;

const PAGE_SIZE: u64 = 4096;

impl MemoryProbe for ProcMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        Some(pages * PAGE_SIZE)
    }
}

const fn default_target_rows() -> usize {
    10_000
}

const fn default_min_rows() -> usize {
    100
}

const fn default_max_workers() -> usize {
    4
}

/// Chunking settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Starting and maximum piece size.
    #[serde(default = "default_target_rows")]
    pub target_rows: usize,
    /// Smallest piece size adaptation may shrink to.
    #[serde(default = "default_min_rows")]
    pub min_rows: usize,
    /// Pieces processed concurrently.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Resident memory above which piece size halves. `None` disables adaptation.
    #[serde(default)]
    pub memory_high_water_bytes: Option<u64>,
    /// What a failed piece does to the rest of the run.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            target_rows: default_target_rows(),
            min_rows: default_min_rows(),
            max_workers: default_max_workers(),
            memory_high_water_bytes: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl ChunkConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target piece size.
    #[must_use]
    pub fn with_target_rows(mut self, rows: usize) -> Self {
        self.target_rows = rows;
        self
    }

    /// Sets the minimum piece size.
    #[must_use]
    pub fn with_min_rows(mut self, rows: usize) -> Self {
        self.min_rows = rows;
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Sets the memory high-water mark.
    #[must_use]
    pub fn with_memory_high_water_bytes(mut self, bytes: u64) -> Self {
        self.memory_high_water_bytes = Some(bytes);
        self
    }

    /// Sets the piece failure policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// A piece that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    /// Zero-based piece index.
    pub index: usize,
    /// Rows in the piece.
    pub rows: usize,
    /// The wrapped operation's error.
    pub error: String,
}

/// Summary of one chunked invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReport {
    /// Pieces processed.
    pub chunks: usize,
    /// Pieces that failed and were tolerated.
    pub failures: Vec<ChunkFailure>,
    /// Piece size in effect at the end.
    pub final_chunk_size: usize,
    /// Input rows.
    pub rows_in: usize,
    /// Output rows.
    pub rows_out: usize,
}

impl ChunkReport {
    /// The report as a statistics value.
    #[must_use]
    pub fn to_statistic(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Copy)]
struct Piece {
    index: usize,
    start: usize,
    end: usize,
    size: usize,
}

/// Plans piece boundaries, consulting the memory probe before each piece.
struct ChunkPlanner<'a> {
    total: usize,
    offset: usize,
    index: usize,
    size: usize,
    target: usize,
    min: usize,
    high_water: Option<u64>,
    probe: &'a dyn MemoryProbe,
}

impl<'a> ChunkPlanner<'a> {
    fn new(total: usize, target: usize, config: &ChunkConfig, probe: &'a dyn MemoryProbe) -> Self {
        let target = target.max(1);
        Self {
            total,
            offset: 0,
            index: 0,
            size: target,
            target,
            min: config.min_rows.clamp(1, target),
            high_water: config.memory_high_water_bytes,
            probe,
        }
    }

    fn adapt(&mut self) {
        let Some(high_water) = self.high_water else { return };
        let Some(resident) = self.probe.resident_bytes() else { return };

        if resident > high_water {
            let next = (self.size / 2).max(self.min);
            if next != self.size {
                debug!(resident, high_water, from = self.size, to = next, "Shrinking chunk size");
            }
            self.size = next;
        } else if resident < high_water / 2 {
            self.size = self.size.saturating_mul(2).min(self.target);
        }
    }
}

impl Iterator for ChunkPlanner<'_> {
    type Item = Piece;

    fn next(&mut self) -> Option<Piece> {
        if self.offset >= self.total {
            return None;
        }
        if self.index > 0 {
            self.adapt();
        }
        let start = self.offset;
        let end = (start + self.size).min(self.total);
        let piece = Piece {
            index: self.index,
            start,
            end,
            size: self.size,
        };
        self.offset = end;
        self.index += 1;
        Some(piece)
    }
}

/// Runs a [`DatasetOperation`] piece by piece.
pub struct ChunkedOperation<O> {
    inner: O,
    config: ChunkConfig,
    probe: Arc<dyn MemoryProbe>,
}

impl<O: fmt::Debug> fmt::Debug for ChunkedOperation<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedOperation")
            .field("inner", &self.inner)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<O: DatasetOperation> ChunkedOperation<O> {
    /// Wraps an operation, reading memory from procfs.
    #[must_use]
    pub fn new(inner: O, config: ChunkConfig) -> Self {
        Self {
            inner,
            config,
            probe: Arc::new(ProcMemoryProbe),
        }
    }

    /// Replaces the memory probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// The chunking settings.
    #[must_use]
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Runs the wrapped operation over `input` using the configured piece size.
    pub async fn run(
        &self,
        params: &ResolvedParams,
        input: &Dataset,
    ) -> Result<(Dataset, ChunkReport), OperationError> {
        self.run_with_target(params, input, self.config.target_rows).await
    }

    /// Runs the wrapped operation with an explicit starting piece size.
    ///
    /// Under a strict failure policy the first failed piece aborts the run and
    /// remaining pieces are dropped. Otherwise failed pieces are left out of
    /// the output and listed in the report.
    pub async fn run_with_target(
        &self,
        params: &ResolvedParams,
        input: &Dataset,
        target_rows: usize,
    ) -> Result<(Dataset, ChunkReport), OperationError> {
        let mut report = ChunkReport {
            rows_in: input.len(),
            final_chunk_size: target_rows.max(1),
            ..ChunkReport::default()
        };
        if input.is_empty() {
            return Ok((Dataset::new(input.columns().to_vec()), report));
        }

        let planner = ChunkPlanner::new(input.len(), target_rows, &self.config, self.probe.as_ref());
        let mut results = stream::iter(planner)
            .map(|piece| {
                let slice = input.slice(piece.start, piece.end);
                async move { (piece, self.inner.apply(params, slice).await) }
            })
            .buffered(self.config.max_workers.max(1));

        let mut outputs = Vec::new();
        while let Some((piece, result)) = results.next().await {
            report.chunks += 1;
            report.final_chunk_size = piece.size;
            match result {
                Ok(output) => outputs.push(output),
                Err(err) => {
                    let failure = ChunkFailure {
                        index: piece.index,
                        rows: piece.end - piece.start,
                        error: err.message,
                    };
                    match self.config.failure_policy {
                        FailurePolicy::Strict => {
                            return Err(OperationError::new(format!(
                                "chunk {} ({} rows) failed: {}",
                                failure.index, failure.rows, failure.error
                            )));
                        }
                        FailurePolicy::Warn => {
                            warn!(
                                chunk = failure.index,
                                rows = failure.rows,
                                error = %failure.error,
                                "Chunk failed; continuing"
                            );
                        }
                        FailurePolicy::Ignore => {
                            debug!(chunk = failure.index, "Chunk failed; ignored");
                        }
                    }
                    report.failures.push(failure);
                }
            }
        }

        let mut output = Dataset::concat(outputs);
        if output.columns().is_empty() {
            output = Dataset::new(input.columns().to_vec());
        }
        report.rows_out = output.len();
        info!(
            chunks = report.chunks,
            rows_in = report.rows_in,
            rows_out = report.rows_out,
            failures = report.failures.len(),
            "Chunked run finished"
        );
        Ok((output, report))
    }
}

#[async_trait]
impl<O: DatasetOperation> Operation for ChunkedOperation<O> {
    fn schema(&self) -> OperationSchema {
        let mut schema = self
            .inner
            .schema()
            .param(ParamSpec::required("input_key", ParamKind::String))
            .param(ParamSpec::optional("output_key", ParamKind::String))
            .param(
                ParamSpec::optional("chunk_size", ParamKind::Integer)
                    .with_description("Starting piece size; overrides the configured target"),
            );
        schema.reads.push(ContextSlot::Datasets);
        schema.writes.push(ContextSlot::Datasets);
        schema.writes.push(ContextSlot::Statistics);
        schema
    }

    async fn execute(&self, params: &ResolvedParams, step: &StepContext<'_>) -> OperationResult {
        let Some(input_key) = params.get_str("input_key") else {
            return OperationResult::fail("missing 'input_key'");
        };
        let output_key = params.get_str("output_key").unwrap_or(input_key);
        let target = params
            .get_i64("chunk_size")
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(self.config.target_rows);

        let input = match step.require_dataset(input_key) {
            Ok(ds) => ds,
            Err(err) => return err.into(),
        };

        match self.run_with_target(params, &input, target).await {
            Ok((output, report)) => OperationResult::ok()
                .with_summary("output_key", json!(output_key))
                .with_summary("rows_in", json!(report.rows_in))
                .with_summary("rows_out", json!(report.rows_out))
                .with_summary("chunks", json!(report.chunks))
                .with_summary("failed_chunks", json!(report.failures.len()))
                .with_changes(
                    ContextDelta::new()
                        .with_dataset(output_key, output)
                        .with_statistic(
                            "chunking",
                            json!({ step.step_name: report.to_statistic() }),
                        ),
                ),
            Err(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Upper {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DatasetOperation for Upper {
        async fn apply(
            &self,
            _params: &ResolvedParams,
            input: Dataset,
        ) -> Result<Dataset, OperationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let rows = input
                .rows()
                .iter()
                .map(|row| {
                    let mut row = row.clone();
                    if let Some(Value::String(s)) = row.get("id") {
                        let upper = s.to_uppercase();
                        row.insert("id".to_string(), Value::String(upper));
                    }
                    row
                })
                .collect();
            Ok(Dataset::from_rows(rows))
        }
    }

    #[derive(Debug)]
    struct FailOnRow(&'static str);

    #[async_trait]
    impl DatasetOperation for FailOnRow {
        async fn apply(
            &self,
            _params: &ResolvedParams,
            input: Dataset,
        ) -> Result<Dataset, OperationError> {
            if input.column_values("id").contains(&json!(self.0)) {
                return Err(OperationError::new(format!("bad row {}", self.0)));
            }
            Ok(input)
        }
    }

    fn dataset(n: usize) -> Dataset {
        Dataset::from_rows(
            (0..n)
                .map(|i| {
                    let mut row = Map::new();
                    row.insert("id".to_string(), json!(format!("p{i}")));
                    row.insert("n".to_string(), json!(i));
                    row
                })
                .collect(),
        )
    }

    fn no_adapt() -> Arc<dyn MemoryProbe> {
        let mut probe = MockMemoryProbe::new();
        probe.expect_resident_bytes().returning(|| None);
        Arc::new(probe)
    }

    #[tokio::test]
    async fn test_chunked_output_matches_single_invocation() {
        let input = dataset(13);
        let params = ResolvedParams::default();
        let whole = Upper::default().apply(&params, input.clone()).await.unwrap();

        for size in 1..=input.len() {
            let chunked = ChunkedOperation::new(
                Upper::default(),
                ChunkConfig::new().with_target_rows(size).with_min_rows(1).with_max_workers(3),
            )
            .with_probe(no_adapt());

            let (output, report) = chunked.run(&params, &input).await.unwrap();
            assert_eq!(output, whole, "chunk size {size}");
            assert_eq!(report.chunks, input.len().div_ceil(size));
            assert_eq!(report.rows_out, 13);
        }
    }

    #[tokio::test]
    async fn test_memory_pressure_halves_then_recovers() {
        let mut probe = MockMemoryProbe::new();
        let mut calls = 0;
        probe.expect_resident_bytes().returning(move || {
            calls += 1;
            Some(if calls <= 2 { 2_000 } else { 100 })
        });

        let chunked = ChunkedOperation::new(
            Upper::default(),
            ChunkConfig::new()
                .with_target_rows(8)
                .with_min_rows(3)
                .with_max_workers(1)
                .with_memory_high_water_bytes(1_000),
        )
        .with_probe(Arc::new(probe));

        let (output, report) = chunked.run(&ResolvedParams::default(), &dataset(30)).await.unwrap();

        // 8, then 4, then clamped to 3, then 6, 8, ...
        assert_eq!(output.len(), 30);
        assert_eq!(report.final_chunk_size, 8);
        assert_eq!(chunked.inner.calls.load(Ordering::SeqCst), report.chunks);
        assert_eq!(report.chunks, 6);
    }

    #[tokio::test]
    async fn test_strict_failure_aborts_with_index() {
        let chunked = ChunkedOperation::new(
            FailOnRow("p5"),
            ChunkConfig::new().with_target_rows(4).with_min_rows(1),
        )
        .with_probe(no_adapt());

        let err = chunked
            .run(&ResolvedParams::default(), &dataset(10))
            .await
            .unwrap_err();
        assert!(err.message.starts_with("chunk 1 (4 rows) failed"));
    }

    #[tokio::test]
    async fn test_warn_policy_skips_failed_piece() {
        let chunked = ChunkedOperation::new(
            FailOnRow("p5"),
            ChunkConfig::new()
                .with_target_rows(4)
                .with_min_rows(1)
                .with_failure_policy(FailurePolicy::Warn),
        )
        .with_probe(no_adapt());

        let (output, report) = chunked.run(&ResolvedParams::default(), &dataset(10)).await.unwrap();
        assert_eq!(output.len(), 6);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].rows, 4);
    }

    #[tokio::test]
    async fn test_empty_input_keeps_columns() {
        let chunked = ChunkedOperation::new(Upper::default(), ChunkConfig::new())
            .with_probe(no_adapt());
        let input = Dataset::new(vec!["id".to_string()]);

        let (output, report) = chunked.run(&ResolvedParams::default(), &input).await.unwrap();
        assert!(output.is_empty());
        assert_eq!(output.columns(), &["id"]);
        assert_eq!(report.chunks, 0);
    }

    #[test]
    fn test_proc_probe_does_not_panic() {
        let _ = ProcMemoryProbe.resident_bytes();
    }
}
