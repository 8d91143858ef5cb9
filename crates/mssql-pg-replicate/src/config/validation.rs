//! Configuration validation.

use super::Config;
use crate::error::{ReplicateError, Result};
use std::collections::HashSet;

/// Validate a parsed configuration before any connection is opened.
pub fn validate(config: &Config) -> Result<()> {
    if config.source.host.is_empty() {
        return Err(ReplicateError::Config("source.host is required".into()));
    }
    if config.source.database.is_empty() {
        return Err(ReplicateError::Config("source.database is required".into()));
    }
    if config.source.user.is_empty() {
        return Err(ReplicateError::Config("source.user is required".into()));
    }

    if config.target.host.is_empty() {
        return Err(ReplicateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(ReplicateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(ReplicateError::Config("target.user is required".into()));
    }

    if config.catalog.as_os_str().is_empty() {
        return Err(ReplicateError::Config("catalog path is required".into()));
    }

    let replication = &config.replication;
    if replication.batch_size == Some(0) {
        return Err(ReplicateError::Config(
            "replication.batch_size must be greater than zero".into(),
        ));
    }
    if replication.workers == Some(0) {
        return Err(ReplicateError::Config(
            "replication.workers must be greater than zero".into(),
        ));
    }
    if replication.max_retries == Some(0) {
        return Err(ReplicateError::Config(
            "replication.max_retries must be at least one".into(),
        ));
    }

    let mut seen = HashSet::new();
    for table in &replication.cycle_override {
        if !seen.insert(table.as_str()) {
            return Err(ReplicateError::Config(format!(
                "replication.cycle_override lists {} twice",
                table
            )));
        }
    }

    Ok(())
}
