//! Error types.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum DaioeError {
    #[error("Missing required columns in {table}: {missing:?}")]
    MissingColumns { table: String, missing: Vec<String> },
    #[error("Invalid classification codes in {table} (expected {expected} characters): {examples:?}")]
    InvalidCode {
        table: String,
        expected: usize,
        examples: Vec<String>,
    },
    #[error("{table} has more than one row for {pairs} (code, year) pairs, e.g. {examples:?}")]
    DuplicateKeys {
        table: String,
        pairs: usize,
        examples: Vec<String>,
    },
    #[error("Input file not found: {0}")]
    MissingInput(PathBuf),
    #[error("No source extracts found matching '{prefix}*.parquet' in {dir}")]
    NoSources { dir: PathBuf, prefix: String },
    #[error("No metric columns with prefix '{0}' in the exposure source")]
    NoMetrics(String),
    #[error("Derived output column '{0}' collides with an existing column")]
    ColumnCollision(String),
    #[error("Variable role {role} matched by more than one variable: {variables:?}")]
    AmbiguousRole { role: String, variables: Vec<String> },
    #[error("No variable found for role {role} (available: {available:?})")]
    MissingRole { role: String, available: Vec<String> },
    #[error("Unexpected table payload: {0}")]
    Payload(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Wrapped polars error: {0}")]
    PolarsError(#[from] polars::error::PolarsError),
    #[error("std IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("serde JSON error: {0}")]
    SerdeJSONError(#[from] serde_json::Error),
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, DaioeError>;

impl DaioeError {
    /// Validation and missing-input failures abort a run before anything is written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DaioeError::MissingColumns { .. }
                | DaioeError::InvalidCode { .. }
                | DaioeError::DuplicateKeys { .. }
                | DaioeError::MissingInput(_)
                | DaioeError::NoSources { .. }
                | DaioeError::NoMetrics(_)
                | DaioeError::ColumnCollision(_)
        )
    }
}
