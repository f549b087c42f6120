//! In-memory vault store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use crate::store::{StorageLocation, VaultStore};
use passvault_common::{Error, Result};

/// In-memory vault store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Reads and writes can be made to fail on demand to
/// exercise rollback paths.
#[derive(Default)]
pub struct MemoryStore {
    files: RwLock<HashMap<StorageLocation, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent read fail with `FileAccess`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail with `FileAccess`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Raw bytes currently stored at `location`.
    pub async fn raw(&self, location: &StorageLocation) -> Option<Vec<u8>> {
        self.files.read().await.get(location).cloned()
    }

    /// Overwrite the raw bytes at `location`, bypassing failure injection.
    pub async fn put_raw(&self, location: &StorageLocation, data: Vec<u8>) {
        self.files.write().await.insert(location.clone(), data);
    }
}

#[async_trait]
impl VaultStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, location: &StorageLocation) -> Result<Vec<u8>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::FileAccess("Simulated read failure".to_string()));
        }

        self.files
            .read()
            .await
            .get(location)
            .cloned()
            .ok_or_else(|| Error::FileAccess("Vault file not found".to_string()))
    }

    async fn write(&self, location: &StorageLocation, data: Vec<u8>) -> Result<u64> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::FileAccess("Simulated write failure".to_string()));
        }

        let len = data.len() as u64;
        self.files.write().await.insert(location.clone(), data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(len)
    }

    async fn exists(&self, location: &StorageLocation) -> Result<bool> {
        Ok(self.files.read().await.contains_key(location))
    }

    async fn size(&self, location: &StorageLocation) -> Result<u64> {
        self.files
            .read()
            .await
            .get(location)
            .map(|data| data.len() as u64)
            .ok_or_else(|| Error::FileAccess("Vault file not found".to_string()))
    }

    async fn delete(&self, location: &StorageLocation) -> Result<()> {
        self.files
            .write()
            .await
            .remove(location)
            .map(|_| ())
            .ok_or_else(|| Error::FileAccess("Vault file not found".to_string()))
    }
}
