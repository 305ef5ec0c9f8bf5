//! Debounced, versioned persistence for a single storage key
//!
//! `Store` wraps [`Storage`] with a single pending-save slot: every call to
//! [`Store::delay_save`] replaces the pending data producer and restarts the
//! timer, so bursts of changes collapse into one write. The producer runs at
//! write time, so the file always reflects the latest state. A producer that
//! returns `None` (its owner is gone) skips the write.

use crate::storage::{Storage, StorageError, StorageFile, StorageResult};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Producer<T> = Box<dyn FnOnce() -> Option<T> + Send>;

struct PendingSave<T> {
    generation: u64,
    producer: Option<Producer<T>>,
    timer: Option<JoinHandle<()>>,
}

struct StoreInner<T> {
    storage: Storage,
    key: String,
    version: u32,
    minor_version: u32,
    pending: Mutex<PendingSave<T>>,
    /// Serializes writes so two saves never race on the temp file
    write_lock: tokio::sync::Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

/// Handle to one versioned storage file. Cloning shares the pending slot.
pub struct Store<T> {
    inner: Arc<StoreInner<T>>,
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Store<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("key", &self.inner.key)
            .field("version", &self.inner.version)
            .field("minor_version", &self.inner.minor_version)
            .finish()
    }
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(storage: Storage, key: impl Into<String>, version: u32, minor_version: u32) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                storage,
                key: key.into(),
                version,
                minor_version,
                pending: Mutex::new(PendingSave {
                    generation: 0,
                    producer: None,
                    timer: None,
                }),
                write_lock: tokio::sync::Mutex::new(()),
                _marker: PhantomData,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Load the stored data.
    ///
    /// Files written by an older minor version load as-is (new fields take
    /// their serde defaults). A newer major version is refused.
    pub async fn load(&self) -> StorageResult<Option<StorageFile<T>>> {
        let Some(file) = self.inner.storage.load::<T>(&self.inner.key).await? else {
            return Ok(None);
        };
        if file.version > self.inner.version {
            return Err(StorageError::VersionMismatch {
                key: self.inner.key.clone(),
                expected: self.inner.version,
                found: file.version,
            });
        }
        if file.version < self.inner.version {
            return Err(StorageError::MigrationRequired {
                key: self.inner.key.clone(),
                from: file.version,
                to: self.inner.version,
            });
        }
        Ok(Some(file))
    }

    /// Write immediately, replacing any pending delayed save
    pub async fn save(&self, data: T) -> StorageResult<()> {
        self.cancel_pending();
        self.write(data).await
    }

    async fn write(&self, data: T) -> StorageResult<()> {
        let _guard = self.inner.write_lock.lock().await;
        let file = StorageFile::new(
            self.inner.key.clone(),
            data,
            self.inner.version,
            self.inner.minor_version,
        );
        self.inner.storage.save(&file).await
    }

    /// Schedule a write after `delay`, coalescing with any pending one
    pub fn delay_save<F>(&self, producer: F, delay: Duration)
    where
        F: FnOnce() -> Option<T> + Send + 'static,
    {
        let mut pending = self.lock_pending();
        pending.generation += 1;
        pending.producer = Some(Box::new(producer));
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }

        let generation = pending.generation;
        let store = self.clone();
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let producer = {
                let mut pending = store.lock_pending();
                if pending.generation != generation {
                    return;
                }
                pending.timer = None;
                pending.producer.take()
            };
            if let Some(data) = producer.and_then(|producer| producer()) {
                if let Err(err) = store.write(data).await {
                    error!(key = %store.inner.key, "Failed to save storage: {}", err);
                }
            }
        }));
        debug!(key = %self.inner.key, ?delay, "Scheduled delayed save");
    }

    /// Whether a delayed save is waiting to be written
    pub fn has_pending(&self) -> bool {
        self.lock_pending().producer.is_some()
    }

    /// Write the pending save now, if there is one
    pub async fn flush(&self) -> StorageResult<()> {
        let producer = {
            let mut pending = self.lock_pending();
            pending.generation += 1;
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            pending.producer.take()
        };
        match producer.and_then(|producer| producer()) {
            Some(data) => self.write(data).await,
            None => Ok(()),
        }
    }

    /// Import a pre-versioned file from the config directory.
    ///
    /// If `legacy_name` exists it is converted, saved under this store's key
    /// and deleted; it takes priority over an existing storage file.
    /// Returns `None` when there is no legacy file.
    pub async fn migrate_legacy<F>(&self, legacy_name: &str, convert: F) -> StorageResult<Option<T>>
    where
        F: FnOnce(serde_json::Value) -> StorageResult<T>,
        T: Clone,
    {
        let Some(raw) = self.inner.storage.read_legacy(legacy_name).await? else {
            return Ok(None);
        };
        let data = convert(raw)?;
        self.save(data.clone()).await?;
        self.inner.storage.remove_legacy(legacy_name).await?;
        debug!(key = %self.inner.key, legacy_name, "Migrated legacy storage file");
        Ok(Some(data))
    }

    fn cancel_pending(&self) {
        let mut pending = self.lock_pending();
        pending.generation += 1;
        pending.producer = None;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingSave<T>> {
        // A poisoned slot only means a producer panicked; the slot itself is still coherent
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
