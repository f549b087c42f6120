//! Registry of known vaults.
//!
//! The registry is durable metadata about vaults (where they live, cached
//! statistics, biometric flag, timestamps). Its lifecycle is independent
//! of any session: entries persist across locks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

use crate::store::StorageLocation;
use passvault_common::{Error, Result, VaultId};

/// Cached statistics about a vault's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultStats {
    pub entry_count: usize,
    pub folder_count: usize,
    pub tag_count: usize,
    pub preset_count: usize,
    pub size_bytes: u64,
}

/// Durable metadata about one vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Unique vault identifier.
    pub id: VaultId,
    /// Display name.
    pub name: String,
    /// Where the vault file lives.
    pub location: StorageLocation,
    /// Cached statistics, refreshed on unlock and save.
    #[serde(default)]
    pub stats: VaultStats,
    /// Whether a wrapped password exists for biometric unlock.
    #[serde(default)]
    pub biometric_unlock_enabled: bool,
    /// Whether this vault is the active session.
    #[serde(default)]
    pub is_loaded: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

impl RegistryEntry {
    /// Create a fresh entry for a new vault.
    pub fn new(id: VaultId, name: impl Into<String>, location: StorageLocation) -> Self {
        Self {
            id,
            name: name.into(),
            location,
            stats: VaultStats::default(),
            biometric_unlock_enabled: false,
            is_loaded: false,
            created_at: Utc::now(),
            last_accessed: None,
            last_modified: None,
        }
    }
}

/// A targeted change to a registry entry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryUpdate {
    /// A session was opened: store stats, mark loaded, bump `last_accessed`.
    Opened(VaultStats),
    /// A save succeeded: store stats, bump `last_modified`.
    Saved(VaultStats),
    /// The session was closed.
    Unloaded,
    /// Toggle the biometric flag.
    BiometricEnabled(bool),
}

impl RegistryUpdate {
    /// Apply this update to an entry.
    pub fn apply(&self, entry: &mut RegistryEntry) {
        let now = Utc::now();
        match self {
            RegistryUpdate::Opened(stats) => {
                entry.stats = *stats;
                entry.is_loaded = true;
                entry.last_accessed = Some(now);
            }
            RegistryUpdate::Saved(stats) => {
                entry.stats = *stats;
                entry.last_modified = Some(now);
            }
            RegistryUpdate::Unloaded => {
                entry.is_loaded = false;
            }
            RegistryUpdate::BiometricEnabled(enabled) => {
                entry.biometric_unlock_enabled = *enabled;
            }
        }
    }
}

/// Catalog of known vaults keyed by vault identifier.
#[async_trait]
pub trait VaultRegistry: Send + Sync {
    /// Look up a vault.
    async fn get(&self, id: &VaultId) -> Result<Option<RegistryEntry>>;

    /// All known vaults, ordered by id.
    async fn list(&self) -> Result<Vec<RegistryEntry>>;

    /// Insert or replace an entry.
    async fn upsert(&self, entry: RegistryEntry) -> Result<()>;

    /// Remove an entry. Removing an unknown id is not an error.
    async fn remove(&self, id: &VaultId) -> Result<()>;

    /// Apply a targeted update.
    ///
    /// # Errors
    /// - `VaultNotFound` if the id is not registered
    async fn update(&self, id: &VaultId, update: RegistryUpdate) -> Result<()>;
}

fn apply_update(
    entries: &mut BTreeMap<VaultId, RegistryEntry>,
    id: &VaultId,
    update: &RegistryUpdate,
) -> Result<()> {
    let entry = entries
        .get_mut(id)
        .ok_or_else(|| Error::VaultNotFound(id.redacted()))?;
    update.apply(entry);
    Ok(())
}

/// Registry held only in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    entries: RwLock<BTreeMap<VaultId, RegistryEntry>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VaultRegistry for MemoryRegistry {
    async fn get(&self, id: &VaultId) -> Result<Option<RegistryEntry>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn upsert(&self, entry: RegistryEntry) -> Result<()> {
        self.entries.write().await.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn remove(&self, id: &VaultId) -> Result<()> {
        self.entries.write().await.remove(id);
        Ok(())
    }

    async fn update(&self, id: &VaultId, update: RegistryUpdate) -> Result<()> {
        apply_update(&mut *self.entries.write().await, id, &update)
    }
}

/// Registry persisted as a JSON file.
///
/// The file is rewritten after every change; reads are served from the
/// in-memory copy loaded at open.
pub struct JsonFileRegistry {
    path: PathBuf,
    entries: RwLock<BTreeMap<VaultId, RegistryEntry>>,
}

impl JsonFileRegistry {
    /// Open the registry at `path`, loading it if the file exists.
    ///
    /// # Errors
    /// - File exists but cannot be read
    /// - File exists but is not a valid registry
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = if tokio::fs::try_exists(&path).await? {
            let bytes = tokio::fs::read(&path).await?;
            let list: Vec<RegistryEntry> = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("Invalid registry file: {}", e)))?;
            list.into_iter().map(|e| (e.id.clone(), e)).collect()
        } else {
            BTreeMap::new()
        };

        debug!("Opened registry with {} vault(s)", entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    async fn persist(&self, entries: &BTreeMap<VaultId, RegistryEntry>) -> Result<()> {
        let list: Vec<&RegistryEntry> = entries.values().collect();
        let json = serde_json::to_vec_pretty(&list)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl VaultRegistry for JsonFileRegistry {
    async fn get(&self, id: &VaultId) -> Result<Option<RegistryEntry>> {
        Ok(self.entries.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn upsert(&self, entry: RegistryEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        next.insert(entry.id.clone(), entry);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn remove(&self, id: &VaultId) -> Result<()> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(id) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(id);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn update(&self, id: &VaultId, update: RegistryUpdate) -> Result<()> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        apply_update(&mut next, id, &update)?;
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str) -> RegistryEntry {
        RegistryEntry::new(
            VaultId::new(id).unwrap(),
            format!("Vault {}", id),
            StorageLocation::Handle(id.to_string()),
        )
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let registry = MemoryRegistry::new();
        registry.upsert(entry("v1")).await.unwrap();

        let found = registry.get(&VaultId::new("v1").unwrap()).await.unwrap();
        assert_eq!(found.unwrap().name, "Vault v1");
        assert!(registry
            .get(&VaultId::new("v2").unwrap())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_vault_fails() {
        let registry = MemoryRegistry::new();
        let result = registry
            .update(&VaultId::new("ghost").unwrap(), RegistryUpdate::Unloaded)
            .await;
        assert!(matches!(result, Err(Error::VaultNotFound(_))));
    }

    #[tokio::test]
    async fn test_opened_and_unloaded() {
        let registry = MemoryRegistry::new();
        let id = VaultId::new("v1").unwrap();
        registry.upsert(entry("v1")).await.unwrap();

        let stats = VaultStats {
            entry_count: 3,
            ..VaultStats::default()
        };
        registry
            .update(&id, RegistryUpdate::Opened(stats))
            .await
            .unwrap();

        let opened = registry.get(&id).await.unwrap().unwrap();
        assert!(opened.is_loaded);
        assert_eq!(opened.stats.entry_count, 3);
        assert!(opened.last_accessed.is_some());

        registry.update(&id, RegistryUpdate::Unloaded).await.unwrap();
        assert!(!registry.get(&id).await.unwrap().unwrap().is_loaded);
    }

    #[tokio::test]
    async fn test_json_registry_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.json");
        let id = VaultId::new("v1").unwrap();

        {
            let registry = JsonFileRegistry::open(&path).await.unwrap();
            registry.upsert(entry("v1")).await.unwrap();
            registry
                .update(&id, RegistryUpdate::BiometricEnabled(true))
                .await
                .unwrap();
        }

        let reopened = JsonFileRegistry::open(&path).await.unwrap();
        let found = reopened.get(&id).await.unwrap().unwrap();
        assert!(found.biometric_unlock_enabled);
        assert_eq!(reopened.list().await.unwrap().len(), 1);

        reopened.remove(&id).await.unwrap();
        let again = JsonFileRegistry::open(&path).await.unwrap();
        assert!(again.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_registry_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            JsonFileRegistry::open(&path).await,
            Err(Error::Serialization(_))
        ));
    }
}
