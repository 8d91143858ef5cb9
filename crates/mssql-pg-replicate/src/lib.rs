//! # mssql-pg-replicate
//!
//! Schema-aware MSSQL to PostgreSQL data replication library.
//!
//! This library moves rows from an MSSQL source into a PostgreSQL
//! destination under an explicit per-column type-coercion policy:
//!
//! - **Typed coercion** with per-row failure reporting (numeric
//!   precision/scale, GUID normalization, boolean encoding, naive
//!   timestamps, length-validated text) - never silent corruption
//! - **Atomic batches** committed through a per-connection transaction
//!   coordinator with bounded retry
//! - **Upsert writes** so replayed batches are idempotent
//! - **Resume capability** via a signed JSON progress file
//! - **Dependency-ordered tables** with concurrent workers for
//!   independent tables
//!
//! ## Example
//!
//! ```rust,no_run
//! use mssql_pg_replicate::{Config, ReplicationDriver};
//!
//! #[tokio::main]
//! async fn main() -> mssql_pg_replicate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let driver = ReplicationDriver::connect(config).await?;
//!     let report = driver.run(None).await?;
//!     println!("{}", report.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod coerce;
pub mod config;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod source;
pub mod target;
pub mod txn;
pub mod value;

// Re-exports for convenient access
pub use catalog::{Catalog, ColumnDescriptor, ReplicationPlan, SourceType, TableDescriptor};
pub use coerce::{coerce_row, coerce_value, ConversionFailure, FailureReason};
pub use config::{Config, ReplicationConfig, SourceConfig, TargetConfig};
pub use driver::ReplicationDriver;
pub use error::{ReplicateError, Result};
pub use progress::{FileProgressStore, ProgressStore, ReplicationProgress};
pub use report::{RunReport, TableReport, TableStatus};
pub use source::{MssqlReader, SourceReader};
pub use target::{DestinationPool, DestinationWriter, PgPool};
pub use txn::{RetryPolicy, TransactionCoordinator, TxnState};
pub use value::{PgValue, RawValue, SourceRow};
