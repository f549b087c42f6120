//! Vault store trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use passvault_common::Result;

/// Where a vault file lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StorageLocation {
    /// A path on the local filesystem.
    File(PathBuf),
    /// An opaque handle resolved by the store (e.g. a document URI).
    Handle(String),
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::File(path) => write!(f, "{}", path.display()),
            StorageLocation::Handle(handle) => write!(f, "handle:{}", handle),
        }
    }
}

/// Reads and writes the opaque encrypted vault file.
///
/// Implementations move bytes only. They never see plaintext or key
/// material, and report every I/O failure as `Error::FileAccess`.
#[async_trait]
pub trait VaultStore: Send + Sync {
    /// Get the store name (e.g., "local", "memory").
    fn name(&self) -> &str;

    /// Read the complete vault file.
    ///
    /// # Errors
    /// - File not found
    /// - I/O errors
    async fn read(&self, location: &StorageLocation) -> Result<Vec<u8>>;

    /// Replace the vault file with `data`.
    ///
    /// # Postconditions
    /// - Either the old or the new content is present, never a mix
    /// - Returns the size of the written file in bytes
    async fn write(&self, location: &StorageLocation, data: Vec<u8>) -> Result<u64>;

    /// Check if a vault file exists.
    async fn exists(&self, location: &StorageLocation) -> Result<bool>;

    /// Size of the vault file in bytes.
    async fn size(&self, location: &StorageLocation) -> Result<u64>;

    /// Delete the vault file.
    async fn delete(&self, location: &StorageLocation) -> Result<()>;
}
