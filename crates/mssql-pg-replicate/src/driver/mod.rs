//! Replication driver - main workflow coordinator.
//!
//! Sequences tables in foreign-key dependency order, runs independent
//! tables concurrently on worker tasks (each owning its own destination
//! connection and transaction coordinator), resumes from recorded progress,
//! and aggregates per-table outcomes into a run report.

use crate::catalog::{build_plan, Catalog, ReplicationPlan};
use crate::config::Config;
use crate::error::Result;
use crate::pipeline;
use crate::progress::{
    FileProgressStore, NullProgressStore, ProgressStore, ProgressTracker, ReplicationProgress,
};
use crate::report::{RunReport, TableReport, TableStatus};
use crate::source::{MssqlReader, SourceReader};
use crate::target::{DestinationPool, PgPool};
use crate::txn::{RetryPolicy, TransactionCoordinator};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info};

/// Replication driver.
pub struct ReplicationDriver {
    config: Config,
    catalog: Catalog,
    source: Arc<dyn SourceReader>,
    target: Arc<dyn DestinationPool>,
    store: Box<dyn ProgressStore>,
}

impl ReplicationDriver {
    /// Connect to source and destination and load the schema catalog.
    pub async fn connect(config: Config) -> Result<Self> {
        let catalog = Catalog::load(&config.catalog)?;

        let workers = config.replication.get_workers();
        let source = MssqlReader::new(config.source.clone(), workers as u32).await?;
        let target = PgPool::new(&config.target, workers).await?;

        Ok(Self {
            config,
            catalog,
            source: Arc::new(source),
            target: Arc::new(target),
            store: Box::new(NullProgressStore),
        })
    }

    /// Build a driver from explicit components (used by tests and embedders).
    pub fn with_components(
        config: Config,
        catalog: Catalog,
        source: Arc<dyn SourceReader>,
        target: Arc<dyn DestinationPool>,
        store: Box<dyn ProgressStore>,
    ) -> Self {
        Self {
            config,
            catalog,
            source,
            target,
            store,
        }
    }

    /// Persist progress to the given file for resume capability.
    pub fn with_progress_file(mut self, path: PathBuf) -> Self {
        self.store = Box::new(FileProgressStore::new(path));
        self
    }

    /// Compute the dependency-ordered replication plan without writing
    /// anything. Schema-integrity problems surface here.
    pub fn plan(&self) -> Result<ReplicationPlan> {
        self.catalog.validate()?;
        build_plan(&self.catalog, &self.config.replication.cycle_override)
    }

    /// Run the replication.
    pub async fn run(self, cancel: Option<watch::Receiver<bool>>) -> Result<RunReport> {
        let started_at = Utc::now();

        // Schema integrity is checked before any write occurs.
        let plan = self.plan()?;

        let cancel = cancel.unwrap_or_else(|| {
            let (_, rx) = watch::channel(false);
            rx
        });

        let config_hash = self.config.hash();
        let progress = match self.store.load().await? {
            Some(existing) => {
                existing.validate_config(&config_hash)?;
                info!("Resuming run {} from recorded progress", existing.run_id);
                existing
            }
            None => ReplicationProgress::new(uuid::Uuid::new_v4().to_string(), config_hash),
        };
        let run_id = progress.run_id.clone();
        let tracker = Arc::new(ProgressTracker::new(progress, self.store));

        info!(
            "Starting replication run {}: {} tables in {} stages",
            run_id,
            plan.table_count(),
            plan.stages.len()
        );

        let batch_size = self.config.replication.get_batch_size();
        let workers = self.config.replication.get_workers();
        let policy = RetryPolicy::from_config(&self.config.replication);
        let semaphore = Arc::new(Semaphore::new(workers));

        let mut reports: Vec<TableReport> = Vec::new();
        let mut cancelled = false;

        for stage in &plan.stages {
            if *cancel.borrow() {
                cancelled = true;
                break;
            }

            let mut handles = Vec::with_capacity(stage.len());

            for name in stage {
                let table = match self.catalog.table(name) {
                    Some(table) => table.clone(),
                    None => continue,
                };

                let permit = semaphore.clone().acquire_owned().await.unwrap();
                let source = self.source.clone();
                let target = self.target.clone();
                let tracker = tracker.clone();
                let policy = policy.clone();
                let cancel = cancel.clone();

                let handle = tokio::spawn(async move {
                    let _permit = permit;

                    let writer = match target.writer().await {
                        Ok(writer) => writer,
                        Err(e) => {
                            return TableReport {
                                table: table.name.clone(),
                                attempted: 0,
                                committed: 0,
                                failures: Vec::new(),
                                status: TableStatus::Fatal,
                                error: Some(e.to_string()),
                            }
                        }
                    };

                    let mut coordinator = TransactionCoordinator::new(writer, policy);
                    pipeline::run_table(
                        &table,
                        source.as_ref(),
                        &mut coordinator,
                        &tracker,
                        batch_size,
                        &cancel,
                    )
                    .await
                });

                handles.push((name.clone(), handle));
            }

            // A stage is a barrier: dependents never start before every
            // table they reference has completed or ended fatal.
            for (name, handle) in handles {
                match handle.await {
                    Ok(report) => {
                        if report.status == TableStatus::Cancelled {
                            cancelled = true;
                        }
                        if report.status == TableStatus::Fatal {
                            error!(
                                "{}: fatal - {}",
                                name,
                                report.error.as_deref().unwrap_or("unknown")
                            );
                        }
                        reports.push(report);
                    }
                    Err(e) => {
                        error!("{}: worker task panicked - {}", name, e);
                        reports.push(TableReport {
                            table: name,
                            attempted: 0,
                            committed: 0,
                            failures: Vec::new(),
                            status: TableStatus::Fatal,
                            error: Some(format!("worker task panicked: {}", e)),
                        });
                    }
                }
            }
        }

        // Tables the run never reached are reported as skipped.
        let reported: HashSet<&str> = reports.iter().map(|r| r.table.as_str()).collect();
        let unreached: Vec<String> = plan
            .flat_order()
            .into_iter()
            .filter(|name| !reported.contains(name))
            .map(|name| name.to_string())
            .collect();
        for name in unreached {
            reports.push(TableReport::skipped(&name));
        }

        let report = RunReport::from_tables(run_id, started_at, cancelled, reports);
        info!(
            "Replication {}: {}/{} tables, {} rows, {} conversion failures in {:.1}s",
            report.status,
            report.tables_completed,
            report.tables_total,
            report.rows_committed,
            report.conversion_failures,
            report.duration_seconds
        );

        Ok(report)
    }
}
