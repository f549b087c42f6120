//! Local filesystem vault store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::store::{StorageLocation, VaultStore};
use passvault_common::{Error, Result};

/// Local filesystem vault store.
///
/// Writes go to a sibling temporary file which is then renamed over the
/// target, so a crash mid-write never leaves a torn vault behind.
#[derive(Debug, Default, Clone)]
pub struct LocalStore;

impl LocalStore {
    /// Create a new local store.
    pub fn new() -> Self {
        Self
    }

    fn resolve(location: &StorageLocation) -> Result<&Path> {
        match location {
            StorageLocation::File(path) => Ok(path.as_path()),
            StorageLocation::Handle(_) => Err(Error::InvalidInput(
                "Local store only supports file locations".to_string(),
            )),
        }
    }

    fn temp_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        path.with_file_name(name)
    }

    #[cfg(unix)]
    async fn restrict_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn restrict_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VaultStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn read(&self, location: &StorageLocation) -> Result<Vec<u8>> {
        let path = Self::resolve(location)?;

        if !path.exists() {
            return Err(Error::FileAccess("Vault file not found".to_string()));
        }

        if path.is_dir() {
            return Err(Error::FileAccess("Vault location is a directory".to_string()));
        }

        Ok(fs::read(path).await?)
    }

    async fn write(&self, location: &StorageLocation, data: Vec<u8>) -> Result<u64> {
        let path = Self::resolve(location)?;

        // Check parent exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                return Err(Error::FileAccess("Parent directory not found".to_string()));
            }
        }

        let tmp = Self::temp_path(path);
        fs::write(&tmp, &data).await?;
        Self::restrict_permissions(&tmp).await?;
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Wrote vault file ({} bytes)", data.len());
        Ok(data.len() as u64)
    }

    async fn exists(&self, location: &StorageLocation) -> Result<bool> {
        let path = Self::resolve(location)?;
        Ok(fs::try_exists(path).await?)
    }

    async fn size(&self, location: &StorageLocation) -> Result<u64> {
        let path = Self::resolve(location)?;
        let meta = fs::metadata(path).await?;
        Ok(meta.len())
    }

    async fn delete(&self, location: &StorageLocation) -> Result<()> {
        let path = Self::resolve(location)?;

        if !path.exists() {
            return Err(Error::FileAccess("Vault file not found".to_string()));
        }

        fs::remove_file(path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn location(dir: &TempDir, name: &str) -> StorageLocation {
        StorageLocation::File(dir.path().join(name))
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new();
        let loc = location(&temp, "vault.pvlt");

        let written = store.write(&loc, b"ciphertext".to_vec()).await.unwrap();
        assert_eq!(written, 10);

        let data = store.read(&loc).await.unwrap();
        assert_eq!(data, b"ciphertext");
        assert_eq!(store.size(&loc).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_overwrite_leaves_no_temp_file() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new();
        let loc = location(&temp, "vault.pvlt");

        store.write(&loc, b"first".to_vec()).await.unwrap();
        store.write(&loc, b"second".to_vec()).await.unwrap();

        assert_eq!(store.read(&loc).await.unwrap(), b"second");
        assert!(!temp.path().join("vault.pvlt.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_missing_is_file_access_error() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new();

        let result = store.read(&location(&temp, "missing.pvlt")).await;
        assert!(matches!(result, Err(Error::FileAccess(_))));
    }

    #[tokio::test]
    async fn test_write_without_parent_fails() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new();
        let loc = StorageLocation::File(temp.path().join("nope").join("vault.pvlt"));

        let result = store.write(&loc, b"data".to_vec()).await;
        assert!(matches!(result, Err(Error::FileAccess(_))));
    }

    #[tokio::test]
    async fn test_handle_locations_rejected() {
        let store = LocalStore::new();
        let loc = StorageLocation::Handle("content://x".to_string());
        assert!(matches!(
            store.read(&loc).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_exists_and_delete() {
        let temp = TempDir::new().unwrap();
        let store = LocalStore::new();
        let loc = location(&temp, "vault.pvlt");

        assert!(!store.exists(&loc).await.unwrap());
        store.write(&loc, b"x".to_vec()).await.unwrap();
        assert!(store.exists(&loc).await.unwrap());

        store.delete(&loc).await.unwrap();
        assert!(!store.exists(&loc).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let store = LocalStore::new();
        let loc = location(&temp, "vault.pvlt");
        store.write(&loc, b"x".to_vec()).await.unwrap();

        let mode = std::fs::metadata(temp.path().join("vault.pvlt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
