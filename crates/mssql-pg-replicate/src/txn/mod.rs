//! Transaction coordination for destination writes.
//!
//! One coordinator owns one destination connection and guarantees
//! atomic, at-most-once application of a batch: the state machine
//! Idle → TransactionOpen → (Committed | RolledBack) → Idle never admits a
//! second open transaction, any write-phase error rolls the whole batch
//! back, and transient failures are retried with bounded exponential
//! backoff. Because progress is recorded only after a successful commit,
//! reapplication after a crash relies on the writer's upsert semantics to
//! stay a no-op.

use crate::catalog::TableDescriptor;
use crate::config::ReplicationConfig;
use crate::error::{ReplicateError, Result};
use crate::target::DestinationWriter;
use crate::value::PgValue;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry behavior for a batch-commit attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt ceiling (including the first attempt).
    pub max_attempts: u32,
    /// Initial backoff between attempts.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Timeout per attempt; applies to one commit attempt, not the table.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            max_attempts: config.get_max_retries(),
            base_backoff: config.get_retry_backoff(),
            max_backoff: config.get_max_backoff(),
            attempt_timeout: config.get_batch_timeout(),
        }
    }

    /// Exponential backoff for the given 1-based attempt, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_backoff.saturating_mul(1u32 << shift);
        delay.min(self.max_backoff)
    }
}

/// Transaction state per destination connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    TransactionOpen,
    Committed,
    RolledBack,
}

/// Coordinates atomic batch application on one destination connection.
pub struct TransactionCoordinator {
    writer: Box<dyn DestinationWriter>,
    policy: RetryPolicy,
    state: TxnState,
}

impl TransactionCoordinator {
    pub fn new(writer: Box<dyn DestinationWriter>, policy: RetryPolicy) -> Self {
        Self {
            writer,
            policy,
            state: TxnState::Idle,
        }
    }

    /// Current transaction state (settles back to Idle between batches).
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Apply one batch atomically: begin, upsert, commit.
    ///
    /// Retryable failures (destination errors, connectivity loss, attempt
    /// timeout) roll back and retry up to the ceiling; exceeding it returns
    /// [`ReplicateError::TableFatal`]. Non-retryable errors propagate after
    /// rollback. No partial batch is ever left committed.
    pub async fn apply(
        &mut self,
        table: &TableDescriptor,
        rows: &[Vec<PgValue>],
    ) -> Result<u64> {
        if self.state != TxnState::Idle {
            return Err(ReplicateError::Transaction(format!(
                "apply called with a transaction already {:?}",
                self.state
            )));
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let max_attempts = self.policy.max_attempts;
        let attempt_timeout = self.policy.attempt_timeout;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let outcome =
                tokio::time::timeout(attempt_timeout, self.attempt(table, rows)).await;

            match outcome {
                Ok(Ok(written)) => {
                    self.state = TxnState::Idle;
                    debug!(
                        "{}: committed {} rows (attempt {})",
                        table.name, written, attempt
                    );
                    return Ok(written);
                }
                Ok(Err(e)) => {
                    self.abort(table).await;
                    if !e.is_retryable() {
                        self.state = TxnState::Idle;
                        return Err(e);
                    }
                    last_error = e.to_string();
                    warn!(
                        "{}: batch attempt {}/{} failed: {}",
                        table.name, attempt, max_attempts, last_error
                    );
                }
                Err(_) => {
                    self.abort(table).await;
                    last_error = format!(
                        "attempt timed out after {:?}",
                        attempt_timeout
                    );
                    warn!(
                        "{}: batch attempt {}/{} timed out",
                        table.name, attempt, max_attempts
                    );
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.backoff_delay(attempt)).await;
            }
        }

        self.state = TxnState::Idle;
        Err(ReplicateError::TableFatal {
            table: table.name.clone(),
            attempts: max_attempts,
            message: last_error,
        })
    }

    async fn attempt(&mut self, table: &TableDescriptor, rows: &[Vec<PgValue>]) -> Result<u64> {
        self.state = TxnState::TransactionOpen;
        self.writer.begin().await?;
        let written = self.writer.upsert_rows(table, rows).await?;
        self.writer.commit().await?;
        self.state = TxnState::Committed;
        Ok(written)
    }

    /// Best-effort rollback; the retry path tolerates a rollback failure on
    /// an already-dead connection.
    async fn abort(&mut self, table: &TableDescriptor) {
        if let Err(e) = self.writer.rollback().await {
            warn!("{}: rollback failed: {}", table.name, e);
        }
        self.state = TxnState::RolledBack;
    }
}
