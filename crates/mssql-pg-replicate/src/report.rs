//! Run reporting types.
//!
//! A completed run always yields a full report, even when some tables
//! failed: per table, the rows attempted and committed this run, every
//! row-level conversion failure, and the final status.

use crate::coerce::ConversionFailure;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Final status of one table's replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    /// All batches committed; conversion failures, if any, were reported
    /// and skipped.
    Completed,
    /// The table halted (retry ceiling, source failure); siblings were not
    /// affected.
    Fatal,
    /// Cancellation was honored between batches.
    Cancelled,
    /// Never started (run cancelled before this table was scheduled).
    Skipped,
}

/// Per-table replication report.
#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    /// Table name.
    pub table: String,

    /// Rows fetched from the source this run.
    pub attempted: u64,

    /// Rows committed to the destination this run.
    pub committed: u64,

    /// Row-level conversion failures (reported and skipped).
    pub failures: Vec<ConversionFailure>,

    /// Final status.
    pub status: TableStatus,

    /// Error message for fatal tables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableReport {
    pub fn skipped(table: &str) -> Self {
        Self {
            table: table.to_string(),
            attempted: 0,
            committed: 0,
            failures: Vec::new(),
            status: TableStatus::Skipped,
            error: None,
        }
    }
}

/// Result of a replication run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: "completed", "failed", or "cancelled".
    pub status: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Total tables in the plan.
    pub tables_total: usize,

    /// Tables that completed.
    pub tables_completed: usize,

    /// Tables that ended fatal.
    pub tables_failed: usize,

    /// Total rows committed this run.
    pub rows_committed: u64,

    /// Total row-level conversion failures this run.
    pub conversion_failures: usize,

    /// Per-table detail.
    pub tables: Vec<TableReport>,
}

impl RunReport {
    /// Assemble the run report from per-table reports.
    pub fn from_tables(
        run_id: String,
        started_at: DateTime<Utc>,
        cancelled: bool,
        tables: Vec<TableReport>,
    ) -> Self {
        let completed_at = Utc::now();
        let duration_seconds = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let tables_completed = tables
            .iter()
            .filter(|t| t.status == TableStatus::Completed)
            .count();
        let tables_failed = tables
            .iter()
            .filter(|t| t.status == TableStatus::Fatal)
            .count();
        let rows_committed = tables.iter().map(|t| t.committed).sum();
        let conversion_failures = tables.iter().map(|t| t.failures.len()).sum();

        let status = if tables_failed > 0 {
            "failed"
        } else if cancelled {
            "cancelled"
        } else {
            "completed"
        };

        Self {
            run_id,
            status: status.to_string(),
            started_at,
            completed_at,
            duration_seconds,
            tables_total: tables.len(),
            tables_completed,
            tables_failed,
            rows_committed,
            conversion_failures,
            tables,
        }
    }

    /// Convert to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
