//! Key-value persistence layer
//!
//! The chain manager only needs get/set, an atomic multi-key write and a
//! close. `SledStore` keeps everything on disk; `MemoryStore` backs tests and
//! throwaway nodes.

use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How long `SledStore::open` waits for a released handle's file lock
pub const LOCK_WAIT: Duration = Duration::from_secs(10);

const LOCK_BACKOFF_START: Duration = Duration::from_millis(5);
const LOCK_BACKOFF_MAX: Duration = Duration::from_millis(250);

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to open store at {path}: {source}")]
    Open { path: String, source: sled::Error },
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Backend(#[from] sled::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Minimal key-value contract consumed by the chain manager
pub trait KvStore: Send {
    /// Fetch a value; a missing key is `StorageError::NotFound`
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// Write a single entry durably
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Write several entries as one atomic unit
    fn write_batch(&self, entries: &[(&[u8], &[u8])]) -> Result<(), StorageError>;

    fn contains(&self, key: &[u8]) -> Result<bool, StorageError>;

    /// Flush and release the handle
    fn close(&self) -> Result<(), StorageError>;
}

/// sled reports a held directory lock as an I/O error
fn is_lock_contention(err: &sled::Error) -> bool {
    match err {
        sled::Error::Io(e) => {
            e.kind() == io::ErrorKind::WouldBlock
                || e.to_string().starts_with("could not acquire lock")
        }
        _ => false,
    }
}

/// Render a key for error messages
fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(text) if text.chars().all(|c| !c.is_control()) => text.to_string(),
        _ => hex::encode(key),
    }
}

/// Sled-backed store
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Probe for a store at `path` without opening it
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().exists()
    }

    /// Open or create the database.
    ///
    /// sled releases its directory lock from background threads some time
    /// after the last handle is dropped, so lock contention is retried with
    /// backoff for up to [`LOCK_WAIT`].
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let deadline = Instant::now() + LOCK_WAIT;
        let mut backoff = LOCK_BACKOFF_START;
        loop {
            match sled::open(path) {
                Ok(db) => return Ok(Self { db }),
                Err(source) if is_lock_contention(&source) && Instant::now() < deadline => {
                    debug!("Store at {} still locked, retrying in {backoff:?}", path.display());
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
                }
                Err(source) => {
                    return Err(StorageError::Open {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }
    }

    /// Open a store that is deleted when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.db
            .get(key)?
            .map(|value| value.to_vec())
            .ok_or_else(|| StorageError::NotFound(display_key(key)))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db.insert(key, value)?;
        self.db.flush()?;
        Ok(())
    }

    fn write_batch(&self, entries: &[(&[u8], &[u8])]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for (key, value) in entries {
            batch.insert(*key, *value);
        }
        self.db.apply_batch(batch)?;
        self.db.flush()?;
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.db.contains_key(key)?)
    }

    fn close(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory store; clones share the same entries
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (fault injection)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Remove an entry directly, bypassing the chain manager
    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(display_key(key)))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.entries.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, entries: &[(&[u8], &[u8])]) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut map = self.entries.lock();
        for (key, value) in entries {
            map.insert(key.to_vec(), value.to_vec());
        }
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.entries.lock().contains_key(key))
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn KvStore) {
        assert!(!store.contains(b"alpha").unwrap());
        assert!(matches!(store.get(b"alpha"), Err(StorageError::NotFound(k)) if k == "alpha"));

        store.set(b"alpha", b"1").unwrap();
        assert_eq!(store.get(b"alpha").unwrap(), b"1".to_vec());

        store
            .write_batch(&[
                (b"beta".as_slice(), b"2".as_slice()),
                (b"alpha".as_slice(), b"3".as_slice()),
            ])
            .unwrap();
        assert_eq!(store.get(b"alpha").unwrap(), b"3".to_vec());
        assert_eq!(store.get(b"beta").unwrap(), b"2".to_vec());
        store.close().unwrap();
    }

    #[test]
    fn test_sled_store_contract() {
        let store = SledStore::temporary().unwrap();
        exercise(&store);
    }

    #[test]
    fn test_memory_store_contract() {
        let store = MemoryStore::new();
        exercise(&store);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sled_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        assert!(!SledStore::exists(&path));

        {
            let store = SledStore::open(&path).unwrap();
            store.set(b"key", b"value").unwrap();
            store.close().unwrap();
        }

        assert!(SledStore::exists(&path));
        let store = SledStore::open(&path).unwrap();
        assert_eq!(store.get(b"key").unwrap(), b"value".to_vec());
    }

    #[test]
    fn test_memory_store_fault_injection() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(matches!(store.set(b"k", b"v"), Err(StorageError::Unavailable(_))));
        assert!(store.is_empty());
        store.set_fail_writes(false);
        store.set(b"k", b"v").unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_reopen_right_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        for round in 0u8..20 {
            let store = SledStore::open(&path).unwrap();
            store.set(b"round", &[round]).unwrap();
            store.close().unwrap();
            drop(store);
        }
        let store = SledStore::open(&path).unwrap();
        assert_eq!(store.get(b"round").unwrap(), vec![19]);
    }

    #[test]
    fn test_lock_contention_detection() {
        let held = sled::Error::Io(io::Error::new(
            io::ErrorKind::Other,
            "could not acquire lock on \"db\": WouldBlock",
        ));
        assert!(is_lock_contention(&held));
        assert!(is_lock_contention(&sled::Error::Io(io::ErrorKind::WouldBlock.into())));
        assert!(!is_lock_contention(&sled::Error::Io(io::ErrorKind::NotFound.into())));
        assert!(!is_lock_contention(&sled::Error::Unsupported("x".to_string())));
    }

    #[test]
    fn test_binary_keys_render_as_hex() {
        assert_eq!(display_key(&[0xde, 0xad]), "dead");
        assert_eq!(display_key(b"state-chainhead"), "state-chainhead");
    }
}
