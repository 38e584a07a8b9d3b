//! Append-only JSONL ledger storage.
//!
//! Every durable record in the system (audit events, delivery attempts,
//! sample and report snapshots) is one JSON document per line in a named
//! ledger file under the data directory. Appends never rewrite existing
//! bytes, so a crash can at worst truncate the final line, which readers
//! tolerate by skipping lines that do not parse.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("ledger I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger entry could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Directory of append-only `.jsonl` ledgers.
#[derive(Debug)]
pub struct LedgerStorage {
    base_path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl LedgerStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn ledger_path(&self, ledger: &str) -> PathBuf {
        self.base_path.join(format!("{ledger}.jsonl"))
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.base_path)
            .await
            .map_err(|source| StorageError::Io {
                path: self.base_path.clone(),
                source,
            })
    }

    /// Append one record to the named ledger. Serializes concurrent
    /// appenders so lines never interleave.
    pub async fn append<T: Serialize>(&self, ledger: &str, entry: &T) -> Result<(), StorageError> {
        let line = serde_json::to_string(entry)? + "\n";
        let path = self.ledger_path(ledger);

        let _guard = self.write_lock.lock().await;
        self.ensure_dir().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| StorageError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| StorageError::Io { path, source })?;
        Ok(())
    }

    /// Read every parseable record from the named ledger in append order.
    /// A missing ledger file reads as empty.
    pub async fn read_all<T: DeserializeOwned>(&self, ledger: &str) -> Result<Vec<T>, StorageError> {
        let path = self.ledger_path(ledger);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::Io { path, source }),
        };

        let mut entries = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!(
                        ledger = %ledger,
                        line = line_no + 1,
                        error = %e,
                        "Skipping unparseable ledger line"
                    );
                }
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestRecord {
        id: u32,
        label: String,
    }

    #[tokio::test]
    async fn test_append_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LedgerStorage::new(dir.path());

        storage
            .append(
                "test",
                &TestRecord {
                    id: 1,
                    label: "first".to_string(),
                },
            )
            .await
            .unwrap();
        storage
            .append(
                "test",
                &TestRecord {
                    id: 2,
                    label: "second".to_string(),
                },
            )
            .await
            .unwrap();

        let records: Vec<TestRecord> = storage.read_all("test").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[1].label, "second");
    }

    #[tokio::test]
    async fn test_read_missing_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LedgerStorage::new(dir.path());
        let records: Vec<TestRecord> = storage.read_all("nothing").await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_final_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LedgerStorage::new(dir.path());
        storage
            .append(
                "test",
                &TestRecord {
                    id: 1,
                    label: "intact".to_string(),
                },
            )
            .await
            .unwrap();

        // Simulate a crash mid-append.
        let path = dir.path().join("test.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"id\":2,\"lab");
        std::fs::write(&path, content).unwrap();

        let records: Vec<TestRecord> = storage.read_all("test").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, "intact");
    }

    #[tokio::test]
    async fn test_ledgers_are_isolated_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LedgerStorage::new(dir.path());
        storage
            .append(
                "alpha",
                &TestRecord {
                    id: 1,
                    label: "a".to_string(),
                },
            )
            .await
            .unwrap();

        let other: Vec<TestRecord> = storage.read_all("beta").await.unwrap();
        assert!(other.is_empty());
    }
}
