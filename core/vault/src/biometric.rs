//! Biometric unlock key management.
//!
//! The master password is wrapped under a key held by a platform
//! keystore (gated by biometrics on devices that have them). Each vault
//! has at most one active wrapped version; enabling or rotating creates a
//! new version and revokes the previous one. Revoked versions are kept as
//! metadata only and their keystore keys are deleted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::events::BiometricEvent;
use passvault_common::{Error, Result, SensitiveBytes, VaultId};
use passvault_crypto::{decrypt, encrypt, MasterKey};

const EVENT_CAPACITY: usize = 16;

/// Platform-backed key storage.
///
/// Keys never leave the keystore; callers only see wrapped blobs.
#[async_trait]
pub trait SecureKeystore: Send + Sync {
    /// Create a new key under `alias`, replacing any existing one.
    async fn create_key(&self, alias: &str) -> Result<()>;

    /// Encrypt `plaintext` under the key `alias`.
    async fn wrap(&self, alias: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a blob produced by `wrap` with the same alias.
    async fn unwrap(&self, alias: &str, blob: &[u8]) -> Result<SensitiveBytes>;

    /// Delete the key `alias`. Deleting an unknown alias is not an error.
    async fn delete_key(&self, alias: &str) -> Result<()>;
}

/// Keystore with random in-memory keys, for builds without a hardware
/// backed store.
#[derive(Default)]
pub struct SoftwareKeystore {
    keys: RwLock<HashMap<String, MasterKey>>,
}

impl SoftwareKeystore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecureKeystore for SoftwareKeystore {
    async fn create_key(&self, alias: &str) -> Result<()> {
        self.keys
            .write()
            .await
            .insert(alias.to_string(), MasterKey::generate());
        Ok(())
    }

    async fn wrap(&self, alias: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let keys = self.keys.read().await;
        let key = keys
            .get(alias)
            .ok_or_else(|| Error::Biometric("Unknown keystore alias".to_string()))?;
        encrypt(key.as_bytes(), plaintext)
    }

    async fn unwrap(&self, alias: &str, blob: &[u8]) -> Result<SensitiveBytes> {
        let keys = self.keys.read().await;
        let key = keys
            .get(alias)
            .ok_or_else(|| Error::Biometric("Unknown keystore alias".to_string()))?;
        decrypt(key.as_bytes(), blob)
            .map(SensitiveBytes::new)
            .map_err(|_| Error::Biometric("Wrapped password rejected".to_string()))
    }

    async fn delete_key(&self, alias: &str) -> Result<()> {
        self.keys.write().await.remove(alias);
        Ok(())
    }
}

/// Metadata for one wrapped key version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiometricKeyMetadata {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

struct ActiveKey {
    version: u32,
    alias: String,
    wrapped: Vec<u8>,
}

#[derive(Default)]
struct VaultKeys {
    versions: Vec<BiometricKeyMetadata>,
    active: Option<ActiveKey>,
}

impl VaultKeys {
    fn next_version(&self) -> u32 {
        self.versions.iter().map(|m| m.version).max().unwrap_or(0) + 1
    }

    fn metadata_mut(&mut self, version: u32) -> Option<&mut BiometricKeyMetadata> {
        self.versions.iter_mut().find(|m| m.version == version)
    }

    fn active_metadata(&self) -> Option<&BiometricKeyMetadata> {
        let version = self.active.as_ref()?.version;
        self.versions.iter().find(|m| m.version == version)
    }
}

fn alias_for(vault_id: &VaultId, version: u32) -> String {
    format!("passvault.biometric.{}.v{}", vault_id.as_str(), version)
}

/// Versioned, revocable biometric keys for every known vault.
pub struct BiometricKeyManager {
    keystore: std::sync::Arc<dyn SecureKeystore>,
    vaults: Mutex<HashMap<VaultId, VaultKeys>>,
    events: broadcast::Sender<BiometricEvent>,
}

impl BiometricKeyManager {
    pub fn new(keystore: std::sync::Arc<dyn SecureKeystore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            keystore,
            vaults: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to rotation lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<BiometricEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BiometricEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Wrap `password` under a new version, revoking any active one.
    ///
    /// Returns the new version number.
    pub async fn create_key_for_vault(&self, vault_id: &VaultId, password: &[u8]) -> Result<u32> {
        let mut vaults = self.vaults.lock().await;
        let keys = vaults.entry(vault_id.clone()).or_default();
        let version = self.install_version(vault_id, keys, password).await?;
        info!(
            "Biometric key v{} created for vault {}",
            version,
            vault_id.redacted()
        );
        Ok(version)
    }

    /// Replace the active version with a freshly wrapped one.
    ///
    /// On failure the active version is left untouched and a
    /// `RotationFailed` event is emitted.
    pub async fn rotate_key(&self, vault_id: &VaultId, password: &[u8]) -> Result<u32> {
        let mut vaults = self.vaults.lock().await;

        let result = match vaults.get_mut(vault_id) {
            Some(keys) if keys.active.is_some() => {
                self.install_version(vault_id, keys, password).await
            }
            _ => Err(Error::Biometric(
                "Biometric unlock is not enabled".to_string(),
            )),
        };

        match result {
            Ok(new_version) => {
                info!(
                    "Biometric key for vault {} rotated to v{}",
                    vault_id.redacted(),
                    new_version
                );
                self.emit(BiometricEvent::RotationCompleted {
                    vault_id: vault_id.clone(),
                    new_version,
                });
                Ok(new_version)
            }
            Err(e) => {
                self.notify_rotation_failed(vault_id, &e);
                Err(e)
            }
        }
    }

    /// Emit `RotationFailed` for a rotation that was refused before it
    /// reached the keystore.
    pub fn notify_rotation_failed(&self, vault_id: &VaultId, error: &Error) {
        warn!(
            "Biometric key rotation failed for vault {}: {}",
            vault_id.redacted(),
            error
        );
        self.emit(BiometricEvent::RotationFailed {
            vault_id: vault_id.clone(),
            reason: error.to_string(),
        });
    }

    async fn install_version(
        &self,
        vault_id: &VaultId,
        keys: &mut VaultKeys,
        password: &[u8],
    ) -> Result<u32> {
        let version = keys.next_version();
        let alias = alias_for(vault_id, version);

        self.keystore.create_key(&alias).await?;
        let wrapped = match self.keystore.wrap(&alias, password).await {
            Ok(wrapped) => wrapped,
            Err(e) => {
                if let Err(cleanup) = self.keystore.delete_key(&alias).await {
                    warn!("Failed to delete unused keystore key: {}", cleanup);
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        if let Some(previous) = keys.active.take() {
            self.discard_key(&previous.alias).await;
            if let Some(meta) = keys.metadata_mut(previous.version) {
                meta.revoked = true;
                meta.revoked_at = Some(now);
            }
        }

        keys.versions.push(BiometricKeyMetadata {
            version,
            created_at: now,
            last_used_at: None,
            revoked: false,
            revoked_at: None,
        });
        keys.active = Some(ActiveKey {
            version,
            alias,
            wrapped,
        });
        Ok(version)
    }

    async fn discard_key(&self, alias: &str) {
        if let Err(e) = self.keystore.delete_key(alias).await {
            warn!("Failed to delete revoked keystore key: {}", e);
        }
    }

    /// Revoke every version for `vault_id`. Idempotent.
    pub async fn revoke_all_keys(&self, vault_id: &VaultId) {
        let mut vaults = self.vaults.lock().await;
        let Some(keys) = vaults.get_mut(vault_id) else {
            return;
        };

        if let Some(active) = keys.active.take() {
            self.discard_key(&active.alias).await;
        }
        let now = Utc::now();
        for meta in keys.versions.iter_mut().filter(|m| !m.revoked) {
            meta.revoked = true;
            meta.revoked_at = Some(now);
        }
        debug!("Biometric keys revoked for vault {}", vault_id.redacted());
    }

    /// Recover the wrapped master password.
    pub async fn unwrap_password(&self, vault_id: &VaultId) -> Result<SensitiveBytes> {
        let vaults = self.vaults.lock().await;
        let active = vaults
            .get(vault_id)
            .and_then(|keys| keys.active.as_ref())
            .ok_or_else(|| Error::Biometric("Biometric unlock is not enabled".to_string()))?;
        self.keystore.unwrap(&active.alias, &active.wrapped).await
    }

    /// Stamp the active version as used now.
    pub async fn mark_used(&self, vault_id: &VaultId) {
        let mut vaults = self.vaults.lock().await;
        if let Some(keys) = vaults.get_mut(vault_id) {
            if let Some(version) = keys.active.as_ref().map(|a| a.version) {
                if let Some(meta) = keys.metadata_mut(version) {
                    meta.last_used_at = Some(Utc::now());
                }
            }
        }
    }

    pub async fn is_enabled(&self, vault_id: &VaultId) -> bool {
        self.active_version(vault_id).await.is_some()
    }

    pub async fn active_version(&self, vault_id: &VaultId) -> Option<u32> {
        let vaults = self.vaults.lock().await;
        vaults
            .get(vault_id)
            .and_then(|keys| keys.active.as_ref())
            .map(|a| a.version)
    }

    /// Every version ever created for `vault_id`, oldest first.
    pub async fn history(&self, vault_id: &VaultId) -> Vec<BiometricKeyMetadata> {
        let vaults = self.vaults.lock().await;
        vaults
            .get(vault_id)
            .map(|keys| keys.versions.clone())
            .unwrap_or_default()
    }

    /// Whether the active version is at least `max_age` old.
    pub async fn is_rotation_due(&self, vault_id: &VaultId, max_age: chrono::Duration) -> bool {
        let vaults = self.vaults.lock().await;
        vaults
            .get(vault_id)
            .and_then(|keys| keys.active_metadata())
            .map(|meta| Utc::now() - meta.created_at >= max_age)
            .unwrap_or(false)
    }

    /// Emit `RotationNeeded` if rotation is due. Never rotates by itself.
    pub async fn check_rotation(&self, vault_id: &VaultId, max_age: chrono::Duration) -> bool {
        let due = self.is_rotation_due(vault_id, max_age).await;
        if due {
            self.emit(BiometricEvent::RotationNeeded {
                vault_id: vault_id.clone(),
            });
        }
        due
    }
}
