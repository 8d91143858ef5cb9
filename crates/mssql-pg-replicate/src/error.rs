//! Error types for the replication library.

use thiserror::Error;

/// Main error type for replication operations.
///
/// Row-level conversion problems are *not* errors: they are collected as
/// [`crate::coerce::ConversionFailure`] data by the pipeline and surfaced in
/// the run report. This enum covers configuration, schema-integrity, and
/// infrastructure failures.
#[derive(Error, Debug)]
pub enum ReplicateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Schema catalog integrity failure (cycle without override, bad column
    /// reference, etc.). Aborts the run before any write occurs.
    #[error("Schema catalog error: {0}")]
    Catalog(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] tiberius::error::Error),

    /// Destination database connection or query error
    #[error("Destination database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// Data transfer failed for a specific table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Retry ceiling exceeded while applying a batch; halts the table.
    #[error("Table {table} halted after {attempts} attempts: {message}")]
    TableFatal {
        table: String,
        attempts: u32,
        message: String,
    },

    /// Transaction coordinator invariant violation (e.g. begin while a
    /// transaction is already open).
    #[error("Transaction state error: {0}")]
    Transaction(String),

    /// Progress file error
    #[error("Progress file error: {0}")]
    Progress(String),

    /// Config hash mismatch on resume
    #[error("Config has changed since last run - cannot resume. Use --force to start fresh.")]
    ConfigChanged,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Replication was cancelled (SIGINT, etc.)
    #[error("Replication cancelled")]
    Cancelled,
}

impl ReplicateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        ReplicateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Transfer error
    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        ReplicateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether the transaction coordinator may retry after this error.
    ///
    /// Destination-level failures during the write phase (constraint
    /// violations, connectivity loss) roll back the batch and are retried up
    /// to the configured ceiling. Everything else propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicateError::Target(_) | ReplicateError::Pool { .. } | ReplicateError::Io(_)
        )
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicateError>;
