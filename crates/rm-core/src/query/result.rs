//! Query results and query-level errors.

use std::time::Duration;

use rm_common::ErrorCategory;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::runner::RunnerError;

/// One record: column name to scalar or null.
pub type Row = Map<String, Value>;

/// Failure of a single query. Recovered by the caller as an empty result.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query tool is not installed")]
    ToolUnavailable,

    #[error("failed to launch query tool: {0}")]
    Launch(#[from] RunnerError),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("query tool exited with {code:?}: {stderr}")]
    Execution { code: Option<i32>, stderr: String },

    #[error("malformed query output: {0}")]
    OutputFormat(String),
}

impl QueryError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::QueryExecution
    }
}

/// Ordered records tagged with the key of the query that produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub key: String,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn new(key: impl Into<String>, rows: Vec<Row>) -> Self {
        QueryResult {
            key: key.into(),
            rows,
        }
    }

    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// First non-empty string value of `column` across the rows.
    pub fn first_str(&self, column: &str) -> Option<&str> {
        self.rows
            .iter()
            .filter_map(|row| row.get(column).and_then(Value::as_str))
            .map(str::trim)
            .find(|s| !s.is_empty())
    }
}

/// Convert decoded tool output into rows.
///
/// The tool emits a JSON array of objects; nested values are kept as-is.
pub fn rows_from_value(value: Value) -> Result<Vec<Row>, QueryError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(QueryError::OutputFormat(format!(
                    "expected object record, got {}",
                    type_name(&other)
                ))),
            })
            .collect(),
        other => Err(QueryError::OutputFormat(format!(
            "expected array of records, got {}",
            type_name(&other)
        ))),
    }
}

/// Decode raw stdout from the simple tier.
pub fn rows_from_stdout(stdout: &[u8]) -> Result<Vec<Row>, QueryError> {
    let trimmed = String::from_utf8_lossy(stdout);
    let trimmed = trimmed.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| QueryError::OutputFormat(e.to_string()))?;
    rows_from_value(value)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
