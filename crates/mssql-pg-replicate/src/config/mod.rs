//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Compute a SHA256 hash of the configuration for resume validation.
    ///
    /// A changed batch size would invalidate recorded resume offsets, so the
    /// hash covers the full configuration.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl SourceConfig {
    /// Build a connection string for tiberius.
    pub fn connection_string(&self) -> String {
        let encrypt = match self.encrypt.to_lowercase().as_str() {
            "true" | "yes" | "1" => "true",
            "false" | "no" | "0" | "disable" => "false",
            _ => "true",
        };

        format!(
            "Server=tcp:{},{};Database={};User Id={};Password={};Encrypt={};TrustServerCertificate={}",
            self.host,
            self.port,
            self.database,
            self.user,
            self.password,
            encrypt,
            self.trust_server_cert
        )
    }
}

impl TargetConfig {
    /// Build a connection string for tokio-postgres.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
source:
  host: sql.internal
  database: erp
  user: reader
  password: secret
target:
  host: pg.internal
  database: erp_mirror
  user: writer
  password: secret
catalog: catalog.yaml
"#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(config.source.port, 1433);
        assert_eq!(config.source.schema, "dbo");
        assert_eq!(config.target.port, 5432);
        assert_eq!(config.target.schema, "public");
        assert_eq!(config.replication.get_batch_size(), 500);
        assert_eq!(config.replication.get_max_retries(), 5);
    }

    #[test]
    fn test_missing_host_rejected() {
        let yaml = minimal_yaml().replace("host: sql.internal", "host: \"\"");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let yaml = format!("{}replication:\n  batch_size: 0\n", minimal_yaml());
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_hash_changes_with_config() {
        let a = Config::from_yaml(minimal_yaml()).unwrap();
        let yaml = format!("{}replication:\n  batch_size: 100\n", minimal_yaml());
        let b = Config::from_yaml(&yaml).unwrap();
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.hash());
    }

    #[test]
    fn test_duplicate_cycle_override_rejected() {
        let yaml = format!(
            "{}replication:\n  cycle_override: [a, a]\n",
            minimal_yaml()
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_connection_strings() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        let mssql = config.source.connection_string();
        assert!(mssql.contains("Server=tcp:sql.internal,1433"));
        assert!(mssql.contains("Encrypt=true"));

        let pg = config.target.connection_string();
        assert!(pg.contains("host=pg.internal"));
        assert!(pg.contains("dbname=erp_mirror"));
    }
}
