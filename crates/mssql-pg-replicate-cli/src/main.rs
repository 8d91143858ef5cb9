//! mssql-pg-replicate CLI - schema-aware MSSQL to PostgreSQL replication.

use clap::{Parser, Subcommand};
use mssql_pg_replicate::{Config, ReplicateError, ReplicationDriver};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mssql-pg-replicate")]
#[command(about = "Schema-aware MSSQL to PostgreSQL replication")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to progress file for resume capability
    #[arg(long)]
    progress_file: Option<PathBuf>,

    /// Output JSON report to stdout
    #[arg(long)]
    output_json: bool,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new replication run
    Run,

    /// Resume a previously interrupted run from the progress file
    Resume,

    /// Print the dependency-ordered replication plan without writing
    Plan,
}

fn init_tracing(verbosity: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Flip the cancel watch on Ctrl-C; the in-flight batch finishes or rolls
/// back before the run stops.
fn spawn_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing in-flight batches");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn execute(cli: Cli) -> Result<(), ReplicateError> {
    let config = Config::load(&cli.config)?;
    let resume = matches!(cli.command, Commands::Resume);

    match cli.command {
        Commands::Plan => {
            // Dry: builds the plan from the catalog without touching either
            // database.
            let catalog = mssql_pg_replicate::Catalog::load(&config.catalog)?;
            catalog.validate()?;
            let plan = mssql_pg_replicate::catalog::build_plan(
                &catalog,
                &config.replication.cycle_override,
            )?;
            for (idx, stage) in plan.stages.iter().enumerate() {
                println!("stage {}: {}", idx + 1, stage.join(", "));
            }
            Ok(())
        }
        Commands::Run | Commands::Resume => {
            let mut driver = ReplicationDriver::connect(config).await?;
            match (&cli.progress_file, resume) {
                (Some(path), _) => {
                    driver = driver.with_progress_file(path.clone());
                }
                (None, true) => {
                    return Err(ReplicateError::Config(
                        "resume requires --progress-file".into(),
                    ));
                }
                (None, false) => {}
            }

            let cancel = spawn_signal_handler();
            let report = driver.run(Some(cancel)).await?;

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                info!(
                    "run {}: {} ({}/{} tables, {} rows committed, {} conversion failures)",
                    report.run_id,
                    report.status,
                    report.tables_completed,
                    report.tables_total,
                    report.rows_committed,
                    report.conversion_failures
                );
                for table in &report.tables {
                    for failure in &table.failures {
                        info!(
                            "  {}: column {} {} (raw: {})",
                            table.table, failure.column, failure.reason, failure.raw_value
                        );
                    }
                }
            }

            if report.status == "failed" {
                return Err(ReplicateError::Transfer {
                    table: report
                        .tables
                        .iter()
                        .filter(|t| t.error.is_some())
                        .map(|t| t.table.clone())
                        .collect::<Vec<_>>()
                        .join(", "),
                    message: "one or more tables failed to replicate".into(),
                });
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.verbosity);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}
