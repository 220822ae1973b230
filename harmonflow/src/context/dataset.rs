//! Tabular datasets held by the execution context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One row: column name to cell value.
pub type Row = Map<String, Value>;

/// An ordered table of rows.
///
/// Datasets are shared between steps behind `Arc` and treated as immutable;
/// operations build a new dataset rather than editing one in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Row>,
}

/// Shape of a dataset, as exposed to `${datasets.*}` references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    /// Number of rows.
    pub row_count: usize,
    /// Column names in order.
    pub columns: Vec<String>,
}

impl Dataset {
    /// Creates an empty dataset with the given columns.
    #[must_use]
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Builds a dataset from rows. Columns are collected in first-seen order.
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    /// Builds a dataset from a JSON array of objects.
    ///
    /// Returns `None` if `value` is not an array of objects.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let rows = value
            .as_array()?
            .iter()
            .map(|row| row.as_object().cloned())
            .collect::<Option<Vec<_>>>()?;
        Some(Self::from_rows(rows))
    }

    /// Column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns true if the dataset has the named column.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Values of one column, `Null` where a row lacks it.
    #[must_use]
    pub fn column_values(&self, name: &str) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| row.get(name).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Appends a row, extending the column list if needed.
    pub fn push_row(&mut self, row: Row) {
        for key in row.keys() {
            if !self.columns.contains(key) {
                self.columns.push(key.clone());
            }
        }
        self.rows.push(row);
    }

    /// Copies rows `start..end` (clamped) into a new dataset.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.rows.len());
        let start = start.min(end);
        Self {
            columns: self.columns.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// Concatenates datasets in order.
    #[must_use]
    pub fn concat(pieces: impl IntoIterator<Item = Self>) -> Self {
        let mut out = Self::default();
        for piece in pieces {
            for column in piece.columns {
                if !out.columns.contains(&column) {
                    out.columns.push(column);
                }
            }
            out.rows.extend(piece.rows);
        }
        out
    }

    /// Shape summary.
    #[must_use]
    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            row_count: self.rows.len(),
            columns: self.columns.clone(),
        }
    }

    /// Rows as a JSON array.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Array(self.rows.iter().cloned().map(Value::Object).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> Dataset {
        Dataset::from_json(&json!([
            {"id": "P1", "name": "a"},
            {"id": "P2"},
            {"id": "P3", "score": 0.5},
        ]))
        .unwrap()
    }

    #[test]
    fn test_columns_in_first_seen_order() {
        let ds = sample();
        assert_eq!(ds.columns(), &["id", "name", "score"]);
        assert_eq!(ds.len(), 3);
    }

    #[test]
    fn test_column_values_fill_null() {
        let ds = sample();
        assert_eq!(ds.column_values("name"), vec![json!("a"), json!(null), json!(null)]);
    }

    #[test]
    fn test_slice_and_concat_round_trip() {
        let ds = sample();
        let pieces = vec![ds.slice(0, 1), ds.slice(1, 2), ds.slice(2, 10)];
        let joined = Dataset::concat(pieces);
        assert_eq!(joined.rows(), ds.rows());
    }

    #[test]
    fn test_slice_clamps() {
        let ds = sample();
        assert!(ds.slice(5, 9).is_empty());
        assert_eq!(ds.slice(2, 1).len(), 0);
    }

    #[test]
    fn test_from_json_rejects_non_objects() {
        assert!(Dataset::from_json(&json!([1, 2])).is_none());
        assert!(Dataset::from_json(&json!({"a": 1})).is_none());
    }

    #[test]
    fn test_summary() {
        let summary = sample().summary();
        assert_eq!(summary.row_count, 3);
        assert_eq!(summary.columns.len(), 3);
    }
}
