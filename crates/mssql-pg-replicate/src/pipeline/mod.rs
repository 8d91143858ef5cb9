//! Row transfer pipeline: source cursor → coercion → batches → coordinator.
//!
//! One pipeline instance streams one table. Rows are consumed in cursor
//! order, batches are committed in sequence-number order, and progress is
//! recorded after every commit, so resume offsets stay valid. Row-level
//! conversion failures never abort the table: the affected rows are
//! reported and skipped while the rest of their batch is committed.

use crate::catalog::TableDescriptor;
use crate::coerce::{coerce_row, CoercedRow};
use crate::progress::ProgressTracker;
use crate::report::{TableReport, TableStatus};
use crate::source::SourceReader;
use crate::txn::TransactionCoordinator;
use crate::value::PgValue;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Replicate one table from source to destination.
///
/// Never returns an error: every failure mode ends up in the report, fatal
/// ones with [`TableStatus::Fatal`] and the triggering message.
pub async fn run_table(
    table: &TableDescriptor,
    source: &dyn SourceReader,
    coordinator: &mut TransactionCoordinator,
    tracker: &ProgressTracker,
    batch_size: usize,
    cancel: &watch::Receiver<bool>,
) -> TableReport {
    let mut report = TableReport {
        table: table.name.clone(),
        attempted: 0,
        committed: 0,
        failures: Vec::new(),
        status: TableStatus::Completed,
        error: None,
    };

    let resume_seq = tracker.last_batch_seq(&table.name).await;
    let resume_offset = resume_seq * batch_size as u64;
    if resume_seq > 0 {
        info!(
            "{}: resuming after batch {} (cursor offset {})",
            table.name, resume_seq, resume_offset
        );
    }

    let mut cursor = source.open_cursor(table, resume_offset);
    let mut seq = resume_seq;
    let mut exhausted = false;

    while !exhausted {
        // Assemble one batch; a partial batch only ever happens at cursor end.
        let mut batch: Vec<CoercedRow> = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match cursor.recv().await {
                Some(Ok(row)) => {
                    report.attempted += 1;
                    match coerce_row(table, &row) {
                        Ok(coerced) => batch.push(coerced),
                        Err(e) => {
                            report.status = TableStatus::Fatal;
                            report.error = Some(e.to_string());
                            return report;
                        }
                    }
                }
                Some(Err(e)) => {
                    report.status = TableStatus::Fatal;
                    report.error = Some(e.to_string());
                    return report;
                }
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if batch.is_empty() {
            break;
        }
        seq += 1;

        // A batch with conversion failures is not submitted whole: failing
        // rows are reported and skipped, the survivors go out as a fresh
        // batch under the same sequence number (the seq counts consumed
        // source batches, keeping resume offsets cursor-aligned).
        let batch_len = batch.len();
        let (clean, rejected): (Vec<CoercedRow>, Vec<CoercedRow>) =
            batch.into_iter().partition(CoercedRow::is_clean);

        if !rejected.is_empty() {
            debug!(
                "{}: batch {} decomposed, {} of {} rows rejected",
                table.name,
                seq,
                rejected.len(),
                batch_len
            );
            for row in rejected {
                for failure in row.failures {
                    warn!(
                        "{}: row skipped, column {}: {} (raw: {})",
                        table.name, failure.column, failure.reason, failure.raw_value
                    );
                    report.failures.push(failure);
                }
            }
        }

        let rows: Vec<Vec<PgValue>> = clean.into_iter().map(|r| r.values).collect();
        match coordinator.apply(table, &rows).await {
            Ok(_) => {
                report.committed += rows.len() as u64;
                // The batch is durable; the sequence number is recorded even
                // when every row was rejected, so resume skips it.
                if let Err(e) = tracker
                    .record_batch(&table.name, seq, rows.len() as u64)
                    .await
                {
                    report.status = TableStatus::Fatal;
                    report.error = Some(e.to_string());
                    return report;
                }
            }
            Err(e) => {
                report.status = TableStatus::Fatal;
                report.error = Some(e.to_string());
                return report;
            }
        }

        // Cancellation is honored between batches; the batch above was
        // finished before we got here.
        if *cancel.borrow() && !exhausted {
            info!("{}: cancellation requested, stopping after batch {}", table.name, seq);
            report.status = TableStatus::Cancelled;
            return report;
        }
    }

    info!(
        "{}: done, {} attempted, {} committed, {} conversion failures",
        table.name,
        report.attempted,
        report.committed,
        report.failures.len()
    );

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnDescriptor, SourceType};
    use crate::coerce::FailureReason;
    use crate::error::Result;
    use crate::progress::{NullProgressStore, ProgressTracker, ReplicationProgress};
    use crate::source::SourceReader;
    use crate::target::DestinationWriter;
    use crate::txn::RetryPolicy;
    use crate::value::{RawValue, SourceRow};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_table() -> TableDescriptor {
        TableDescriptor {
            name: "flags".into(),
            columns: vec![
                ColumnDescriptor {
                    name: "id".into(),
                    source_type: SourceType::Int,
                    nullable: false,
                    max_length: None,
                },
                ColumnDescriptor {
                    name: "active".into(),
                    source_type: SourceType::Bool,
                    nullable: false,
                    max_length: None,
                },
            ],
            primary_key: vec!["id".into()],
            foreign_keys: vec![],
            depth_column: None,
        }
    }

    /// In-memory source: serves preloaded rows, honoring the resume offset.
    struct VecSource {
        rows: Vec<SourceRow>,
    }

    impl SourceReader for VecSource {
        fn open_cursor(
            &self,
            _table: &TableDescriptor,
            resume_offset: u64,
        ) -> mpsc::Receiver<Result<SourceRow>> {
            let (tx, rx) = mpsc::channel(64);
            let rows: Vec<SourceRow> =
                self.rows.iter().skip(resume_offset as usize).cloned().collect();
            tokio::spawn(async move {
                for row in rows {
                    if tx.send(Ok(row)).await.is_err() {
                        return;
                    }
                }
            });
            rx
        }
    }

    /// Writer that records every committed row.
    struct RecordingWriter {
        committed: Arc<Mutex<Vec<Vec<PgValue>>>>,
        staged: Vec<Vec<PgValue>>,
    }

    #[async_trait]
    impl DestinationWriter for RecordingWriter {
        async fn begin(&mut self) -> Result<()> {
            self.staged.clear();
            Ok(())
        }

        async fn upsert_rows(
            &mut self,
            _table: &TableDescriptor,
            rows: &[Vec<PgValue>],
        ) -> Result<u64> {
            self.staged.extend(rows.iter().cloned());
            Ok(rows.len() as u64)
        }

        async fn commit(&mut self) -> Result<()> {
            self.committed
                .lock()
                .unwrap()
                .extend(self.staged.drain(..));
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            self.staged.clear();
            Ok(())
        }
    }

    fn coordinator(committed: Arc<Mutex<Vec<Vec<PgValue>>>>) -> TransactionCoordinator {
        TransactionCoordinator::new(
            Box::new(RecordingWriter {
                committed,
                staged: Vec::new(),
            }),
            RetryPolicy {
                max_attempts: 2,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                attempt_timeout: Duration::from_secs(5),
            },
        )
    }

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(
            ReplicationProgress::new("run".into(), "hash".into()),
            Box::new(NullProgressStore),
        )
    }

    fn bool_rows(count: usize, bad_index: Option<usize>) -> Vec<SourceRow> {
        (0..count)
            .map(|i| {
                let flag = if Some(i) == bad_index {
                    RawValue::Text("maybe".into())
                } else {
                    RawValue::Int((i % 2) as i64)
                };
                SourceRow::new(vec![RawValue::Int(i as i64), flag])
            })
            .collect()
    }

    #[tokio::test]
    async fn test_batch_decomposition_commits_good_rows() {
        // 100 rows, row 57 has an invalid boolean: 99 committed, one failure.
        let committed = Arc::new(Mutex::new(Vec::new()));
        let source = VecSource {
            rows: bool_rows(100, Some(57)),
        };
        let mut coordinator = coordinator(committed.clone());
        let tracker = tracker();
        let (_tx, cancel) = watch::channel(false);

        let report = run_table(
            &test_table(),
            &source,
            &mut coordinator,
            &tracker,
            100,
            &cancel,
        )
        .await;

        assert_eq!(report.status, TableStatus::Completed);
        assert_eq!(report.attempted, 100);
        assert_eq!(report.committed, 99);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].column, "active");
        assert_eq!(report.failures[0].reason, FailureReason::InvalidBoolean);
        assert_eq!(committed.lock().unwrap().len(), 99);
    }

    #[tokio::test]
    async fn test_progress_recorded_per_batch() {
        let committed = Arc::new(Mutex::new(Vec::new()));
        let source = VecSource {
            rows: bool_rows(25, None),
        };
        let mut coordinator = coordinator(committed.clone());
        let tracker = tracker();
        let (_tx, cancel) = watch::channel(false);

        let report = run_table(
            &test_table(),
            &source,
            &mut coordinator,
            &tracker,
            10,
            &cancel,
        )
        .await;

        assert_eq!(report.status, TableStatus::Completed);
        assert_eq!(report.committed, 25);
        // Three batches consumed: 10 + 10 + 5.
        assert_eq!(tracker.last_batch_seq("flags").await, 3);
    }

    #[tokio::test]
    async fn test_resume_skips_committed_batches() {
        let committed = Arc::new(Mutex::new(Vec::new()));
        let source = VecSource {
            rows: bool_rows(40, None),
        };
        let mut coordinator = coordinator(committed.clone());

        // Batches 1 and 2 (10 rows each) already committed in a prior run.
        let tracker = tracker();
        tracker.record_batch("flags", 1, 10).await.unwrap();
        tracker.record_batch("flags", 2, 10).await.unwrap();

        let (_tx, cancel) = watch::channel(false);
        let report = run_table(
            &test_table(),
            &source,
            &mut coordinator,
            &tracker,
            10,
            &cancel,
        )
        .await;

        assert_eq!(report.status, TableStatus::Completed);
        // Only rows 20..40 were fetched this run.
        assert_eq!(report.attempted, 20);
        assert_eq!(report.committed, 20);
        assert_eq!(tracker.last_batch_seq("flags").await, 4);

        let written = committed.lock().unwrap();
        assert_eq!(written.len(), 20);
        assert_eq!(written[0][0], PgValue::Int(20));
    }

    #[tokio::test]
    async fn test_cancellation_between_batches() {
        let committed = Arc::new(Mutex::new(Vec::new()));
        let source = VecSource {
            rows: bool_rows(50, None),
        };
        let mut coordinator = coordinator(committed.clone());
        let tracker = tracker();

        let (tx, cancel) = watch::channel(true);
        let report = run_table(
            &test_table(),
            &source,
            &mut coordinator,
            &tracker,
            10,
            &cancel,
        )
        .await;
        drop(tx);

        // The in-flight batch finished before cancellation was honored.
        assert_eq!(report.status, TableStatus::Cancelled);
        assert_eq!(report.committed, 10);
        assert_eq!(committed.lock().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_all_rows_rejected_still_advances_progress() {
        let committed = Arc::new(Mutex::new(Vec::new()));
        // Every row invalid: nothing committed, but the consumed batch is
        // still recorded so resume does not refetch it.
        let rows = (0..5)
            .map(|i| SourceRow::new(vec![RawValue::Int(i), RawValue::Text("bad".into())]))
            .collect();
        let source = VecSource { rows };
        let mut coordinator = coordinator(committed.clone());
        let tracker = tracker();
        let (_tx, cancel) = watch::channel(false);

        let report = run_table(
            &test_table(),
            &source,
            &mut coordinator,
            &tracker,
            5,
            &cancel,
        )
        .await;

        assert_eq!(report.status, TableStatus::Completed);
        assert_eq!(report.committed, 0);
        assert_eq!(report.failures.len(), 5);
        assert_eq!(tracker.last_batch_seq("flags").await, 1);
        assert!(committed.lock().unwrap().is_empty());
    }
}
