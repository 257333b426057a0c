//! Periodic snapshot persistence
//!
//! The store is written to a JSON file every few seconds and once more on
//! shutdown. This is best-effort durability: writes made after the last save
//! are lost on a crash. Versions are not persisted; reloaded keys start over
//! at version 1.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::store::Store;

/// Errors while loading or saving snapshots
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed snapshot {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// On-disk snapshot layout
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    saved_at: DateTime<Utc>,
    records: HashMap<String, String>,
}

/// Saves and restores store snapshots at a fixed path
pub struct Persister {
    path: PathBuf,
    /// Serializes concurrent saves
    lock: Mutex<()>,
}

impl Persister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Feed every saved pair to `setter`. A missing file loads nothing.
    /// Returns the number of pairs loaded.
    pub fn load<F>(&self, mut setter: F) -> Result<usize, PersistenceError>
    where
        F: FnMut(&str, &str),
    {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Persistence: no snapshot at {:?}", self.path);
                return Ok(0);
            }
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let snapshot: SnapshotFile =
            serde_json::from_str(&data).map_err(|source| PersistenceError::Json {
                path: self.path.clone(),
                source,
            })?;

        for (key, value) in &snapshot.records {
            setter(key, value);
        }

        info!(
            "Persistence: loaded {} records from {:?} (saved {})",
            snapshot.records.len(),
            self.path,
            snapshot.saved_at
        );
        Ok(snapshot.records.len())
    }

    /// Write `records` to disk through a temporary file and rename
    pub fn save(&self, records: HashMap<String, String>) -> Result<(), PersistenceError> {
        let _guard = self.lock.lock();

        let snapshot = SnapshotFile {
            saved_at: Utc::now(),
            records,
        };
        let data = serde_json::to_vec(&snapshot).map_err(|source| PersistenceError::Json {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("tmp");
        let io_err = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };
        fs::write(&tmp, data).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        debug!(
            "Persistence: saved {} records to {:?}",
            snapshot.records.len(),
            self.path
        );
        Ok(())
    }

    /// Save the store every `interval` until the task is aborted
    pub fn spawn_save_loop(self: &Arc<Self>, store: Arc<Store>, interval: Duration) -> JoinHandle<()> {
        let persister = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = persister.save(store.list()) {
                    error!("Persistence: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let persister = Persister::new(dir.path().join("storage.json"));

        let store = Store::default();
        store.set("a", "1");
        store.set("b", "2");
        persister.save(store.list()).unwrap();
        assert!(!dir.path().join("storage.tmp").exists());

        let restored = Store::default();
        let count = persister.load(|k, v| {
            restored.set(k, v);
        }).unwrap();

        assert_eq!(count, 2);
        assert_eq!(restored.list(), store.list());
    }

    #[test]
    fn test_missing_file_loads_nothing() {
        let dir = tempdir().unwrap();
        let persister = Persister::new(dir.path().join("absent.json"));
        let count = persister.load(|_, _| panic!("nothing to load")).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "{ not json").unwrap();

        let persister = Persister::new(&path);
        assert!(matches!(
            persister.load(|_, _| {}),
            Err(PersistenceError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_save_loop_writes_periodically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let persister = Arc::new(Persister::new(&path));

        let store = Arc::new(Store::default());
        store.set("k", "v");
        let handle = persister.spawn_save_loop(store, Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        let mut loaded = HashMap::new();
        persister
            .load(|k, v| {
                loaded.insert(k.to_string(), v.to_string());
            })
            .unwrap();
        assert_eq!(loaded.get("k"), Some(&"v".to_string()));
    }
}
