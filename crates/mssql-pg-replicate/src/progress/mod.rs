//! Durable replication progress for resume capability.
//!
//! Progress maps each table to its last successfully committed batch
//! sequence number. It is written after every commit, so a crash between
//! commit and progress write can at worst replay one batch, which the
//! destination's upsert semantics absorb.

use crate::error::{ReplicateError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Per-table progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableProgress {
    /// Last successfully committed batch sequence number.
    pub last_batch_seq: u64,

    /// Rows committed so far across runs.
    pub rows_committed: u64,
}

/// Process-wide replication progress for one run, possibly resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationProgress {
    /// Unique run identifier.
    pub run_id: String,

    /// SHA256 hash of the configuration; resume offsets are only valid
    /// against the configuration that produced them.
    pub config_hash: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// Per-table progress, keyed by table name.
    pub tables: HashMap<String, TableProgress>,

    /// HMAC-SHA256 signature for integrity validation, keyed by the config
    /// hash. Computed over the serialized progress excluding this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl ReplicationProgress {
    /// Create fresh progress for a new run.
    pub fn new(run_id: String, config_hash: String) -> Self {
        Self {
            run_id,
            config_hash,
            started_at: Utc::now(),
            tables: HashMap::new(),
            hmac: None,
        }
    }

    /// Last committed batch sequence for a table (0 if never committed).
    pub fn last_batch_seq(&self, table: &str) -> u64 {
        self.tables.get(table).map(|t| t.last_batch_seq).unwrap_or(0)
    }

    /// Record a committed batch. Sequence numbers are monotonic per table.
    pub fn record_batch(&mut self, table: &str, seq: u64, rows: u64) {
        let entry = self.tables.entry(table.to_string()).or_default();
        entry.last_batch_seq = entry.last_batch_seq.max(seq);
        entry.rows_committed += rows;
    }

    /// Validate that the config hash matches for resume.
    pub fn validate_config(&self, config_hash: &str) -> Result<()> {
        if self.config_hash != config_hash {
            return Err(ReplicateError::ConfigChanged);
        }
        Ok(())
    }

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes()).map_err(|e| {
            ReplicateError::Progress(format!("failed to create HMAC: {}", e))
        })?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Sign the progress for persistence.
    pub fn sign(&mut self) -> Result<()> {
        self.hmac = Some(self.compute_hmac()?);
        Ok(())
    }

    /// Validate the signature of loaded progress.
    pub fn verify(&self) -> Result<()> {
        match &self.hmac {
            Some(stored) => {
                let expected = self.compute_hmac()?;
                if stored != &expected {
                    return Err(ReplicateError::Progress(
                        "progress file integrity check failed: HMAC mismatch".into(),
                    ));
                }
                Ok(())
            }
            None => {
                warn!("progress file has no HMAC signature, integrity cannot be verified");
                Ok(())
            }
        }
    }
}

/// Persists replication progress between runs.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load previously persisted progress, if any.
    async fn load(&self) -> Result<Option<ReplicationProgress>>;

    /// Persist the given progress snapshot.
    async fn save(&self, progress: &ReplicationProgress) -> Result<()>;
}

/// JSON-file-backed progress store with atomic writes.
pub struct FileProgressStore {
    path: PathBuf,
}

impl FileProgressStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ProgressStore for FileProgressStore {
    async fn load(&self) -> Result<Option<ReplicationProgress>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let progress: ReplicationProgress = serde_json::from_str(&content)?;
        progress.verify()?;
        Ok(Some(progress))
    }

    async fn save(&self, progress: &ReplicationProgress) -> Result<()> {
        let mut signed = progress.clone();
        signed.sign()?;
        let content = serde_json::to_string_pretty(&signed)?;

        // Atomic write: temp file, then rename.
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// Discards progress; used when no progress file is configured.
pub struct NullProgressStore;

#[async_trait]
impl ProgressStore for NullProgressStore {
    async fn load(&self) -> Result<Option<ReplicationProgress>> {
        Ok(None)
    }

    async fn save(&self, _progress: &ReplicationProgress) -> Result<()> {
        Ok(())
    }
}

/// Shared progress: in-memory state plus the backing store.
///
/// Workers update concurrently; the mutex serializes the read-modify-write
/// and the save behind it so checkpoint files are never interleaved.
pub struct ProgressTracker {
    inner: Mutex<ReplicationProgress>,
    store: Box<dyn ProgressStore>,
}

impl ProgressTracker {
    pub fn new(progress: ReplicationProgress, store: Box<dyn ProgressStore>) -> Self {
        Self {
            inner: Mutex::new(progress),
            store,
        }
    }

    /// Last committed batch sequence for a table.
    pub async fn last_batch_seq(&self, table: &str) -> u64 {
        self.inner.lock().await.last_batch_seq(table)
    }

    /// Record a committed batch and persist the checkpoint.
    pub async fn record_batch(&self, table: &str, seq: u64, rows: u64) -> Result<()> {
        let mut progress = self.inner.lock().await;
        progress.record_batch(table, seq, rows);
        self.store.save(&progress).await
    }

    /// Snapshot of the current progress.
    pub async fn snapshot(&self) -> ReplicationProgress {
        self.inner.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, FileProgressStore) {
        let dir = TempDir::new().unwrap();
        let store = FileProgressStore::new(dir.path().join("progress.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let (_dir, store) = temp_store();

        let mut progress = ReplicationProgress::new("run-1".into(), "abc123".into());
        progress.record_batch("customers", 4, 2000);
        store.save(&progress).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.last_batch_seq("customers"), 4);
        assert_eq!(loaded.tables["customers"].rows_committed, 2000);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_none() {
        let (_dir, store) = temp_store();
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_file_rejected() {
        let (dir, store) = temp_store();

        let progress = ReplicationProgress::new("run-1".into(), "abc123".into());
        store.save(&progress).await.unwrap();

        let path = dir.path().join("progress.json");
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("run-1", "run-9")).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, ReplicateError::Progress(_)));
    }

    #[tokio::test]
    async fn test_config_hash_validation() {
        let progress = ReplicationProgress::new("run-1".into(), "abc123".into());
        assert!(progress.validate_config("abc123").is_ok());
        assert!(matches!(
            progress.validate_config("different"),
            Err(ReplicateError::ConfigChanged)
        ));
    }

    #[test]
    fn test_record_batch_is_monotonic() {
        let mut progress = ReplicationProgress::new("r".into(), "h".into());
        progress.record_batch("t", 3, 300);
        progress.record_batch("t", 2, 0);
        assert_eq!(progress.last_batch_seq("t"), 3);
        assert_eq!(progress.last_batch_seq("unknown"), 0);
    }

    #[tokio::test]
    async fn test_tracker_records_and_persists() {
        let (_dir, store) = temp_store();
        let path_store = FileProgressStore::new(_dir.path().join("progress.json"));

        let tracker = ProgressTracker::new(
            ReplicationProgress::new("run-1".into(), "h".into()),
            Box::new(store),
        );
        tracker.record_batch("orders", 1, 500).await.unwrap();
        tracker.record_batch("orders", 2, 500).await.unwrap();

        assert_eq!(tracker.last_batch_seq("orders").await, 2);

        let reloaded = path_store.load().await.unwrap().unwrap();
        assert_eq!(reloaded.last_batch_seq("orders"), 2);
        assert_eq!(reloaded.tables["orders"].rows_committed, 1000);
    }
}
