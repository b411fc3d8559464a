//! Persistence of the replica between runs.

use crate::error::{ClientError, ClientResult};
use parking_lot::Mutex;
use rowsync_core::{Identity, Row, RowKey};
use rowsync_protocol::{from_cbor, to_cbor, PendingLog};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One server row as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRow {
    /// Table.
    pub table: String,
    /// Primary key.
    pub key: RowKey,
    /// Row content.
    pub row: Row,
    /// Server version.
    pub version: u64,
}

/// Everything a client needs to resume offline after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheState {
    /// Schema version the state was written under.
    pub schema_version: String,
    /// Client id the pending log belongs to.
    pub client_id: String,
    /// Identity the pending log was recorded for.
    pub identity: Option<Identity>,
    /// Server epoch of the cursors.
    pub epoch: Option<String>,
    /// Change-log cursor per table.
    pub cursors: BTreeMap<String, u64>,
    /// Tables delivered at least once.
    pub delivered: BTreeSet<String>,
    /// Server rows.
    pub rows: Vec<CachedRow>,
    /// Unconfirmed mutations.
    pub pending: PendingLog,
}

/// Where a client keeps its [`CacheState`].
pub trait CacheStore: Send + Sync {
    /// Loads the saved state, if any.
    fn load(&self) -> ClientResult<Option<CacheState>>;

    /// Replaces the saved state.
    fn save(&self, state: &CacheState) -> ClientResult<()>;

    /// Deletes the saved state.
    fn clear(&self) -> ClientResult<()>;
}

/// Keeps the state in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    state: Mutex<Option<CacheState>>,
}

impl MemoryCacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn load(&self) -> ClientResult<Option<CacheState>> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &CacheState) -> ClientResult<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    fn clear(&self) -> ClientResult<()> {
        *self.state.lock() = None;
        Ok(())
    }
}

/// Keeps the state in a single CBOR file.
#[derive(Debug)]
pub struct FileCacheStore {
    path: PathBuf,
}

impl FileCacheStore {
    /// Uses the file at `path`. The parent directory must exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }
}

impl CacheStore for FileCacheStore {
    fn load(&self) -> ClientResult<Option<CacheState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)?;
        from_cbor(&data)
            .map(Some)
            .map_err(|e| ClientError::Storage(format!("{}: {e}", self.path.display())))
    }

    /// Writes to a temporary file, syncs it, then renames it over the
    /// previous state so a crash never leaves a torn file behind.
    fn save(&self, state: &CacheState) -> ClientResult<()> {
        let data = to_cbor(state).map_err(|e| ClientError::Storage(e.to_string()))?;
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> ClientResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_core::{MutationKind, MutationOp};
    use tempfile::tempdir;

    fn state() -> CacheState {
        let mut pending = PendingLog::new();
        pending.append(MutationKind::new(
            "block",
            MutationOp::Delete,
            Row::new().with("id", "b1"),
        ));
        CacheState {
            schema_version: "v1".into(),
            client_id: "client-a".into(),
            identity: Some(Identity::new("A")),
            epoch: Some("e1".into()),
            cursors: BTreeMap::from([("block".to_string(), 4)]),
            delivered: BTreeSet::from(["block".to_string()]),
            rows: vec![CachedRow {
                table: "block".into(),
                key: RowKey::single("b0"),
                row: Row::new().with("id", "b0"),
                version: 4,
            }],
            pending,
        }
    }

    #[test]
    fn memory_store() {
        let store = MemoryCacheStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&state()).unwrap();
        assert_eq!(store.load().unwrap(), Some(state()));
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica.cbor");

        let store = FileCacheStore::new(&path);
        assert!(store.load().unwrap().is_none());
        store.save(&state()).unwrap();
        assert!(!store.temp_path().exists());

        let reopened = FileCacheStore::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(state()));

        reopened.clear().unwrap();
        reopened.clear().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_is_a_storage_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replica.cbor");
        fs::write(&path, b"not cbor").unwrap();
        assert!(matches!(
            FileCacheStore::new(&path).load(),
            Err(ClientError::Storage(_))
        ));
    }
}
