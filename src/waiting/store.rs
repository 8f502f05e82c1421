//! Keyed byte-record storage behind the waiting store.

use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::StoreError;

/// Flat keyed storage for waiting records.
///
/// Keys are host names, optionally suffixed `:<generation>` for
/// continuation records. A handle is a transaction scope: backends
/// that need mutual exclusion hold it for the life of the handle.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a record, `None` when the key has never been written.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write or replace a record.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Remove a record. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory record store.
///
/// A `HashMap` behind an `RwLock`, primarily for tests; clones share
/// the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryRecordStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .records
            .read()
            .map_err(|_| StoreError::Lock("record map poisoned".into()))?
            .get(key)
            .cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Lock("record map poisoned".into()))?
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Lock("record map poisoned".into()))?
            .remove(key);
        Ok(())
    }
}

/// Name of the per-directory mutual-exclusion lock file.
const LOCK_FILE: &str = ".lock";

/// How long `open` waits for a competing handle to release the lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between lock acquisition attempts.
const LOCK_RETRY: Duration = Duration::from_millis(100);

/// File-backed record store: one file per key inside a per-transport
/// directory, serialized against concurrent deliveries by a lock file
/// held for the life of the handle.
#[derive(Debug)]
pub struct FileRecordStore {
    dir: PathBuf,
    locked: bool,
}

impl FileRecordStore {
    /// Open the store, creating the directory if needed and acquiring
    /// the directory lock.
    ///
    /// # Errors
    /// [`StoreError::Lock`] when another handle holds the lock past
    /// the acquisition deadline, or any filesystem failure.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let lock = dir.join(LOCK_FILE);
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock)
                .await
            {
                Ok(_) => break,
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Lock(lock.display().to_string()));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(error) => return Err(error.into()),
            }
        }

        Ok(Self { dir, locked: true })
    }

    /// Release the directory lock and consume the handle.
    ///
    /// # Errors
    /// Propagates the lock file's removal failure.
    pub async fn close(mut self) -> Result<(), StoreError> {
        self.locked = false;
        tokio::fs::remove_file(self.dir.join(LOCK_FILE)).await?;
        Ok(())
    }

    fn keyed_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty()
            || key == LOCK_FILE
            || key
                .bytes()
                .any(|b| !(b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_' | b':')))
            || key.split(':').any(|part| part == "..")
        {
            return Err(StoreError::InvalidKey(key.to_owned()));
        }
        Ok(self.dir.join(key))
    }
}

impl Drop for FileRecordStore {
    fn drop(&mut self) {
        // Last-ditch unlock when close() was skipped.
        if self.locked {
            drop(std::fs::remove_file(self.dir.join(LOCK_FILE)));
        }
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.keyed_path(key)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        tokio::fs::write(self.keyed_path(key)?, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.keyed_path(key)?).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
