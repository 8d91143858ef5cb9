//! Configuration type definitions with auto-tuned worker defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_bytes: sys.total_memory(),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (MSSQL).
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    pub target: TargetConfig,

    /// Path to the schema catalog YAML file.
    pub catalog: PathBuf,

    /// Replication behavior configuration.
    #[serde(default)]
    pub replication: ReplicationConfig,
}

/// Source database (MSSQL) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 1433).
    #[serde(default = "default_mssql_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Source schema (default: "dbo").
    #[serde(default = "default_dbo_schema")]
    pub schema: String,

    /// Encrypt connection (default: "true").
    #[serde(default = "default_true_string")]
    pub encrypt: String,

    /// Trust server certificate (default: false).
    #[serde(default)]
    pub trust_server_cert: bool,
}

/// Target database (PostgreSQL) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,
}

/// Replication behavior configuration.
///
/// Performance-related fields use `Option<T>` to distinguish "not set" (use
/// the tuned default) from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationConfig {
    /// Rows per batch. Small enough that a rollback's cost stays bounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Number of concurrent table workers. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Retry attempt ceiling per batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Initial retry backoff in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,

    /// Backoff ceiling in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,

    /// Timeout per batch-commit attempt in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout_secs: Option<u64>,

    /// Externally-decided order for tables on a multi-table FK cycle.
    #[serde(default)]
    pub cycle_override: Vec<String>,
}

impl ReplicationConfig {
    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(500)
    }

    /// Worker count, auto-tuned from CPU cores when not configured.
    pub fn get_workers(&self) -> usize {
        self.workers
            .unwrap_or_else(|| SystemResources::detect().cpu_cores.clamp(1, 8))
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(5)
    }

    pub fn get_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.unwrap_or(200))
    }

    pub fn get_max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.unwrap_or(30_000))
    }

    pub fn get_batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs.unwrap_or(60))
    }
}

fn default_mssql_port() -> u16 {
    1433
}

fn default_pg_port() -> u16 {
    5432
}

fn default_dbo_schema() -> String {
    "dbo".to_string()
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_true_string() -> String {
    "true".to_string()
}
