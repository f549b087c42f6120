//! Session manager: the single owner of the active vault session.
//!
//! Lock ordering is mutation lock, then session-transition lock, then the
//! session slot. Unlock only holds the transition lock while installing a
//! session; locking a previous vault during a switch happens outside it.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::autolock;
use crate::biometric::{BiometricKeyManager, SecureKeystore};
use crate::codec;
use crate::config::SessionConfig;
use crate::events::{BiometricEvent, LockReason, UnlockRequired};
use crate::model::{Entry, EntryTagLink, Folder, Preset, Tag, VaultData};
use crate::rate_limit::UnlockRateLimiter;
use crate::session::{SessionHandle, VaultSession};
use passvault_common::{Error, Result, VaultId};
use passvault_crypto::{derive_key, keys_match, KdfParams, MasterKey, Salt};
use passvault_storage::{
    RegistryEntry, RegistryUpdate, StorageLocation, VaultFile, VaultFileHeader, VaultRegistry,
    VaultStats, VaultStore,
};

const EVENT_CAPACITY: usize = 16;

/// Public view of the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub vault_id: VaultId,
    pub unlocked_at: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
}

pub(crate) struct ManagerInner {
    config: SessionConfig,
    store: Arc<dyn VaultStore>,
    registry: Arc<dyn VaultRegistry>,
    rate_limiter: UnlockRateLimiter,
    biometric: BiometricKeyManager,
    foreground: AtomicBool,
    /// Serializes session install and removal.
    transition: Mutex<()>,
    /// Serializes the optimistic update, persist, rollback sequence.
    mutation: Mutex<()>,
    session: RwLock<Option<VaultSession>>,
    active_vault: watch::Sender<Option<VaultId>>,
    unlock_required: broadcast::Sender<UnlockRequired>,
}

/// Restores the previous snapshot unless committed.
///
/// Dropping the guard without committing, including when the owning
/// future is cancelled mid-save, rolls the session back.
struct RollbackGuard<'a> {
    session: &'a VaultSession,
    previous: Option<Arc<VaultData>>,
}

impl<'a> RollbackGuard<'a> {
    fn new(session: &'a VaultSession, previous: Arc<VaultData>) -> Self {
        Self {
            session,
            previous: Some(previous),
        }
    }

    fn commit(mut self) {
        self.previous = None;
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            self.session.publish(previous);
        }
    }
}

fn stats_for(data: &VaultData, size_bytes: u64) -> VaultStats {
    VaultStats {
        entry_count: data.entries.len(),
        folder_count: data.folders.len(),
        tag_count: data.tags.len(),
        preset_count: data.presets.len(),
        size_bytes,
    }
}

/// Run CPU-heavy work (the KDF) off the async workers.
///
/// Panics inside the closure are resumed on the caller.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(Error::Unknown(format!("Blocking task failed: {}", e))),
    }
}

async fn derive_key_blocking(password: &[u8], salt: Salt, params: KdfParams) -> Result<MasterKey> {
    let password = Zeroizing::new(password.to_vec());
    run_blocking(move || derive_key(&password, &salt, &params)).await
}

/// Orchestrates unlock, lock, mutation and key management for one
/// process. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Create a manager with no active session.
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn VaultStore>,
        registry: Arc<dyn VaultRegistry>,
        keystore: Arc<dyn SecureKeystore>,
    ) -> Self {
        let (active_vault, _) = watch::channel(None);
        let (unlock_required, _) = broadcast::channel(EVENT_CAPACITY);
        let rate_limiter = UnlockRateLimiter::new(config.rate_limit.clone());

        Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                registry,
                rate_limiter,
                biometric: BiometricKeyManager::new(keystore),
                foreground: AtomicBool::new(false),
                transition: Mutex::new(()),
                mutation: Mutex::new(()),
                session: RwLock::new(None),
                active_vault,
                unlock_required,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn biometric(&self) -> &BiometricKeyManager {
        &self.inner.biometric
    }

    pub fn rate_limiter(&self) -> &UnlockRateLimiter {
        &self.inner.rate_limiter
    }

    // ---- vault catalog ----

    /// All registered vaults.
    pub async fn list_vaults(&self) -> Result<Vec<RegistryEntry>> {
        self.inner.registry.list().await
    }

    /// Create and register an empty vault with a random id.
    pub async fn create_vault(
        &self,
        name: &str,
        location: StorageLocation,
        password: &[u8],
    ) -> Result<VaultId> {
        let vault_id = VaultId::new(uuid::Uuid::new_v4().to_string())?;
        self.create_vault_with_id(vault_id.clone(), name, location, password)
            .await?;
        Ok(vault_id)
    }

    /// Create and register an empty vault under `vault_id`.
    ///
    /// The vault is left locked.
    ///
    /// # Errors
    /// - `InvalidInput` if the id is taken or a file exists at `location`
    pub async fn create_vault_with_id(
        &self,
        vault_id: VaultId,
        name: &str,
        location: StorageLocation,
        password: &[u8],
    ) -> Result<()> {
        if self.inner.registry.get(&vault_id).await?.is_some() {
            return Err(Error::InvalidInput("Vault id already registered".to_string()));
        }
        if self.inner.store.exists(&location).await? {
            return Err(Error::InvalidInput(
                "A file already exists at this location".to_string(),
            ));
        }

        let salt = Salt::generate();
        let kdf = self.inner.config.kdf.clone();
        let key = derive_key_blocking(password, salt.clone(), kdf.clone()).await?;
        let header = VaultFileHeader::new(&salt, kdf);

        let data = VaultData::new();
        let bytes = codec::seal(&data, &key, &header)?;
        let size = self.inner.store.write(&location, bytes).await?;

        let mut entry = RegistryEntry::new(vault_id.clone(), name, location);
        entry.stats = stats_for(&data, size);
        self.inner.registry.upsert(entry).await?;

        info!("Created vault {}", vault_id.redacted());
        Ok(())
    }

    /// Delete a vault's file, biometric keys and registry entry.
    pub async fn remove_vault(&self, vault_id: &VaultId) -> Result<()> {
        if self.active_vault_id().as_ref() == Some(vault_id) {
            self.lock_with_reason(LockReason::Removed).await;
        }

        let entry = self
            .inner
            .registry
            .get(vault_id)
            .await?
            .ok_or_else(|| Error::VaultNotFound(vault_id.redacted()))?;

        if self.inner.store.exists(&entry.location).await? {
            self.inner.store.delete(&entry.location).await?;
        }
        self.inner.biometric.revoke_all_keys(vault_id).await;
        self.inner.rate_limiter.reset(vault_id);
        self.inner.registry.remove(vault_id).await?;

        info!("Removed vault {}", vault_id.redacted());
        Ok(())
    }

    // ---- unlock / lock ----

    /// Unlock `vault_id`, locking any other active vault first.
    ///
    /// # Errors
    /// - `TooManyAttempts` while locked out; no decryption is attempted
    /// - `VaultNotFound` if the vault is not registered
    /// - `DecryptionFailed`, `FileAccess`, `InvalidFileFormat` from loading
    pub async fn unlock(&self, vault_id: &VaultId, password: &[u8]) -> Result<()> {
        // Held until the attempt settles; dropping it unsettled (same vault
        // already open, unknown vault, cancellation) gives the slot back.
        let attempt = match self.inner.rate_limiter.begin_attempt(vault_id) {
            Ok(attempt) => attempt,
            Err(seconds_remaining) => {
                warn!(
                    "Unlock of vault {} refused, locked out for {}s",
                    vault_id.redacted(),
                    seconds_remaining
                );
                return Err(Error::TooManyAttempts { seconds_remaining });
            }
        };

        {
            let slot = self.inner.session.read().await;
            if let Some(session) = slot.as_ref() {
                if session.vault_id() == vault_id {
                    session.touch();
                    self.arm_timer(session).await;
                    return Ok(());
                }
            }
        }

        if self.active_vault_id().is_some() {
            self.lock_with_reason(LockReason::VaultSwitch).await;
        }

        let entry = self
            .inner
            .registry
            .get(vault_id)
            .await?
            .ok_or_else(|| Error::VaultNotFound(vault_id.redacted()))?;

        let (session, size) = match self.load_session(vault_id, &entry.location, password).await {
            Ok(loaded) => loaded,
            Err(e) => {
                attempt.fail();
                if e.is_domain() {
                    debug!("Unlock of vault {} rejected: {}", vault_id.redacted(), e);
                } else {
                    warn!("Unlock of vault {} failed: {}", vault_id.redacted(), e);
                }
                return Err(e);
            }
        };
        let stats = stats_for(&session.snapshot(), size);

        let mut pending = Some(session);
        loop {
            {
                let _transition = self.inner.transition.lock().await;
                let mut slot = self.inner.session.write().await;
                let installed = if slot.is_none() {
                    *slot = pending.take();
                    true
                } else {
                    // A concurrent unlock of the same vault may have won.
                    slot.as_ref().is_some_and(|s| s.vault_id() == vault_id)
                };
                if installed {
                    if let Some(current) = slot.as_ref() {
                        self.arm_timer(current).await;
                    }
                    drop(slot);
                    // Published before the transition lock is released so
                    // a racing switch cannot be overtaken by a stale value.
                    self.inner.active_vault.send_replace(Some(vault_id.clone()));
                    if let Err(e) = self
                        .inner
                        .registry
                        .update(vault_id, RegistryUpdate::Opened(stats))
                        .await
                    {
                        warn!("Failed to refresh registry for {}: {}", vault_id.redacted(), e);
                    }
                    break;
                }
            }
            self.lock_with_reason(LockReason::VaultSwitch).await;
        }
        drop(pending);
        attempt.succeed();

        if entry.biometric_unlock_enabled && self.inner.biometric.is_enabled(vault_id).await {
            self.inner.biometric.mark_used(vault_id).await;
            self.inner
                .biometric
                .check_rotation(vault_id, self.inner.config.biometric_rotation_age())
                .await;
        }

        info!("Vault {} unlocked", vault_id.redacted());
        Ok(())
    }

    async fn load_session(
        &self,
        vault_id: &VaultId,
        location: &StorageLocation,
        password: &[u8],
    ) -> Result<(VaultSession, u64)> {
        let bytes = self.inner.store.read(location).await?;
        let file = VaultFile::from_bytes(&bytes)?;
        let salt = file.header.salt()?;
        let key =
            derive_key_blocking(password, salt.clone(), file.header.kdf_params.clone()).await?;
        let data = codec::open(&file, &key)?;

        debug!(
            "Decrypted vault {} ({} entries)",
            vault_id.redacted(),
            data.entries.len()
        );
        let session = VaultSession::new(
            vault_id.clone(),
            location.clone(),
            key,
            file.header,
            salt,
            data,
        );
        Ok((session, bytes.len() as u64))
    }

    /// Unlock using the biometric-wrapped master password.
    ///
    /// Goes through the same rate limiting as `unlock`.
    pub async fn unlock_with_biometric(&self, vault_id: &VaultId) -> Result<()> {
        let entry = self
            .inner
            .registry
            .get(vault_id)
            .await?
            .ok_or_else(|| Error::VaultNotFound(vault_id.redacted()))?;
        if !entry.biometric_unlock_enabled {
            return Err(Error::Biometric(
                "Biometric unlock is not enabled".to_string(),
            ));
        }

        let password = self.inner.biometric.unwrap_password(vault_id).await?;
        self.unlock(vault_id, password.as_bytes()).await
    }

    /// Lock the active vault. Never fails; a no-op when nothing is unlocked.
    pub async fn lock(&self) {
        self.lock_with_reason(LockReason::Manual).await;
    }

    pub async fn lock_with_reason(&self, reason: LockReason) {
        let _mutation = self.inner.mutation.lock().await;
        self.close_session(reason, None).await;
    }

    /// Lock on behalf of the auto-lock timer, only if the timer that fired
    /// is still the current one.
    pub(crate) async fn expire(&self, handle: &SessionHandle, generation: u64) {
        let _mutation = self.inner.mutation.lock().await;
        self.close_session(LockReason::AutoLock, Some((handle, generation)))
            .await;
    }

    /// Caller must hold the mutation lock.
    async fn close_session(&self, reason: LockReason, expected: Option<(&SessionHandle, u64)>) {
        let is_target = |session: &VaultSession| match expected {
            Some((handle, generation)) => {
                session.handle() == handle && session.generation() == generation
            }
            None => true,
        };

        {
            let slot = self.inner.session.read().await;
            let Some(session) = slot.as_ref().filter(|s| is_target(*s)) else {
                return;
            };
            let data = session.snapshot();
            if let Err(e) = self.persist(session, &data).await {
                warn!(
                    "Final save of vault {} failed: {}",
                    session.vault_id().redacted(),
                    e
                );
            }
        }

        let transition = self.inner.transition.lock().await;
        let session = {
            let mut slot = self.inner.session.write().await;
            if slot.as_ref().is_some_and(|s| is_target(s)) {
                slot.take()
            } else {
                None
            }
        };
        let Some(session) = session else {
            return;
        };

        let vault_id = session.vault_id().clone();
        // Drops the key and aborts the timer.
        drop(session);

        self.inner.active_vault.send_replace(None);
        if let Err(e) = self
            .inner
            .registry
            .update(&vault_id, RegistryUpdate::Unloaded)
            .await
        {
            warn!("Failed to mark {} unloaded: {}", vault_id.redacted(), e);
        }
        drop(transition);

        let _ = self.inner.unlock_required.send(UnlockRequired {
            vault_id: vault_id.clone(),
            reason,
        });

        info!("Vault {} locked ({:?})", vault_id.redacted(), reason);
    }

    // ---- auto-lock ----

    async fn arm_timer(&self, session: &VaultSession) {
        let generation = session.next_generation();
        let task = tokio::spawn(autolock::run(
            Arc::downgrade(&self.inner),
            session.handle().clone(),
            generation,
            self.inner.config.auto_lock_timeout(),
            self.inner.config.foreground_poll_interval(),
        ));
        session.set_timer(task).await;
    }

    pub(crate) async fn is_current(&self, handle: &SessionHandle, generation: u64) -> bool {
        let slot = self.inner.session.read().await;
        slot.as_ref()
            .is_some_and(|s| s.handle() == handle && s.generation() == generation)
    }

    /// Report whether the app is visible. An expired timer defers the
    /// lock while this is true.
    pub fn set_app_foreground(&self, foreground: bool) {
        self.inner.foreground.store(foreground, Ordering::SeqCst);
    }

    pub fn is_app_foreground(&self) -> bool {
        self.inner.foreground.load(Ordering::SeqCst)
    }

    /// Record user activity and restart the inactivity window.
    pub async fn touch(&self) {
        let slot = self.inner.session.read().await;
        if let Some(session) = slot.as_ref() {
            session.touch();
            self.arm_timer(session).await;
        }
    }

    // ---- mutation pipeline ----

    async fn persist(&self, session: &VaultSession, data: &VaultData) -> Result<VaultStats> {
        let bytes = codec::seal(data, session.key(), session.header())?;
        let size = self.inner.store.write(session.location(), bytes).await?;
        Ok(stats_for(data, size))
    }

    /// Apply `mutator` to the current data and persist the result.
    ///
    /// Domain errors from the mutator leave everything untouched. A
    /// result equal to the current data skips the write. A failed write
    /// rolls the in-memory data back and returns `SaveFailed`.
    async fn mutate<F>(&self, op: &str, mutator: F) -> Result<()>
    where
        F: FnOnce(&VaultData) -> Result<VaultData> + Send,
    {
        let _mutation = self.inner.mutation.lock().await;
        let slot = self.inner.session.read().await;
        let session = slot.as_ref().ok_or(Error::VaultLocked)?;

        let current = session.snapshot();
        let next = match mutator(current.as_ref()) {
            Ok(next) => next,
            Err(e) => {
                if !e.is_domain() {
                    warn!("{} on vault {} failed: {}", op, session.vault_id().redacted(), e);
                }
                return Err(e);
            }
        };
        session.touch();

        if next == *current {
            debug!("{} changed nothing, skipping save", op);
            self.arm_timer(session).await;
            return Ok(());
        }

        let next = Arc::new(next);
        let guard = RollbackGuard::new(session, current);
        session.publish(next.clone());

        match self.persist(session, &next).await {
            Ok(stats) => {
                guard.commit();
                if let Err(e) = self
                    .inner
                    .registry
                    .update(session.vault_id(), RegistryUpdate::Saved(stats))
                    .await
                {
                    warn!("Failed to refresh registry stats: {}", e);
                }
                self.arm_timer(session).await;
                Ok(())
            }
            Err(e) => {
                drop(guard);
                error!(
                    "{} on vault {} rolled back: {}",
                    op,
                    session.vault_id().redacted(),
                    e
                );
                Err(Error::SaveFailed(e.to_string()))
            }
        }
    }

    pub async fn add_entry(&self, entry: Entry) -> Result<()> {
        self.mutate("add_entry", move |data| data.with_entry_added(entry))
            .await
    }

    pub async fn update_entry(&self, entry: Entry) -> Result<()> {
        self.mutate("update_entry", move |data| data.with_entry_updated(entry))
            .await
    }

    pub async fn delete_entry(&self, entry_id: &str) -> Result<()> {
        self.mutate("delete_entry", |data| data.with_entry_deleted(entry_id))
            .await
    }

    pub async fn add_folder(&self, folder: Folder) -> Result<()> {
        self.mutate("add_folder", move |data| data.with_folder_added(folder))
            .await
    }

    pub async fn update_folder(&self, folder: Folder) -> Result<()> {
        self.mutate("update_folder", move |data| data.with_folder_updated(folder))
            .await
    }

    /// Delete a folder. Its entries are kept with no folder.
    pub async fn delete_folder(&self, folder_id: &str) -> Result<()> {
        self.mutate("delete_folder", |data| data.with_folder_deleted(folder_id))
            .await
    }

    pub async fn add_tag(&self, tag: Tag) -> Result<()> {
        self.mutate("add_tag", move |data| data.with_tag_added(tag))
            .await
    }

    pub async fn update_tag(&self, tag: Tag) -> Result<()> {
        self.mutate("update_tag", move |data| data.with_tag_updated(tag))
            .await
    }

    /// Delete a tag and every link to it.
    pub async fn delete_tag(&self, tag_id: &str) -> Result<()> {
        self.mutate("delete_tag", |data| data.with_tag_deleted(tag_id))
            .await
    }

    pub async fn add_tag_to_entry(&self, entry_id: &str, tag_id: &str) -> Result<()> {
        self.mutate("add_tag_to_entry", |data| {
            data.with_tag_linked(entry_id, tag_id)
        })
        .await
    }

    pub async fn remove_tag_from_entry(&self, entry_id: &str, tag_id: &str) -> Result<()> {
        self.mutate("remove_tag_from_entry", |data| {
            data.with_tag_unlinked(entry_id, tag_id)
        })
        .await
    }

    pub async fn add_preset(&self, preset: Preset) -> Result<()> {
        self.mutate("add_preset", move |data| data.with_preset_added(preset))
            .await
    }

    pub async fn update_preset(&self, preset: Preset) -> Result<()> {
        self.mutate("update_preset", move |data| data.with_preset_updated(preset))
            .await
    }

    pub async fn delete_preset(&self, preset_id: &str) -> Result<()> {
        self.mutate("delete_preset", |data| data.with_preset_deleted(preset_id))
            .await
    }

    // ---- keys ----

    /// Check `password` against the live session key.
    ///
    /// Returns the active vault id on success.
    async fn verify_session_password(&self, password: &[u8]) -> Result<VaultId> {
        let slot = self.inner.session.read().await;
        let session = slot.as_ref().ok_or(Error::VaultLocked)?;

        let candidate = derive_key_blocking(
            password,
            session.salt().clone(),
            session.header().kdf_params.clone(),
        )
        .await?;
        let matches = keys_match(&candidate, session.key());
        drop(candidate);

        if matches {
            Ok(session.vault_id().clone())
        } else {
            Err(Error::AuthenticationFailed)
        }
    }

    /// Re-key the active vault under `new_password`.
    ///
    /// Nothing changes unless `current_password` matches and the
    /// re-encrypted vault was written. Biometric keys are revoked since
    /// they wrap the old password.
    ///
    /// # Errors
    /// - `AuthenticationFailed` if `current_password` is wrong
    /// - `SaveFailed` if the re-encrypted vault could not be written
    pub async fn change_master_password(
        &self,
        current_password: &[u8],
        new_password: &[u8],
    ) -> Result<()> {
        let _mutation = self.inner.mutation.lock().await;

        let vault_id = self.verify_session_password(current_password).await?;

        let salt = Salt::generate();
        let kdf = self.inner.config.kdf.clone();
        let key = derive_key_blocking(new_password, salt.clone(), kdf.clone()).await?;
        let header = VaultFileHeader::new(&salt, kdf);

        {
            let slot = self.inner.session.read().await;
            let session = slot.as_ref().ok_or(Error::VaultLocked)?;
            let data = session.snapshot();
            let bytes = codec::seal(&data, &key, &header)?;
            let size = self
                .inner
                .store
                .write(session.location(), bytes)
                .await
                .map_err(|e| Error::SaveFailed(e.to_string()))?;
            if let Err(e) = self
                .inner
                .registry
                .update(&vault_id, RegistryUpdate::Saved(stats_for(&data, size)))
                .await
            {
                warn!("Failed to refresh registry stats: {}", e);
            }
        }

        self.inner.biometric.revoke_all_keys(&vault_id).await;
        if let Err(e) = self
            .inner
            .registry
            .update(&vault_id, RegistryUpdate::BiometricEnabled(false))
            .await
        {
            warn!("Failed to clear biometric flag: {}", e);
        }

        {
            let _transition = self.inner.transition.lock().await;
            let mut slot = self.inner.session.write().await;
            if let Some(session) = slot.as_mut() {
                session.replace_keys(key, header, salt);
                session.touch();
                self.arm_timer(session).await;
            }
        }

        info!("Master password changed for vault {}", vault_id.redacted());
        Ok(())
    }

    /// Wrap the master password for biometric unlock of the active vault.
    ///
    /// Returns the new key version.
    pub async fn enable_biometric(&self, password: &[u8]) -> Result<u32> {
        let vault_id = self.verify_session_password(password).await?;

        let version = self
            .inner
            .biometric
            .create_key_for_vault(&vault_id, password)
            .await?;
        if let Err(e) = self
            .inner
            .registry
            .update(&vault_id, RegistryUpdate::BiometricEnabled(true))
            .await
        {
            self.inner.biometric.revoke_all_keys(&vault_id).await;
            return Err(e);
        }
        Ok(version)
    }

    /// Re-wrap the master password under a new key version.
    pub async fn rotate_biometric_key(&self, password: &[u8]) -> Result<u32> {
        let vault_id = match self.verify_session_password(password).await {
            Ok(vault_id) => vault_id,
            Err(e) => {
                if let Some(vault_id) = self.active_vault_id() {
                    self.inner.biometric.notify_rotation_failed(&vault_id, &e);
                }
                return Err(e);
            }
        };
        self.inner.biometric.rotate_key(&vault_id, password).await
    }

    /// Revoke biometric unlock for the active vault.
    pub async fn disable_biometric(&self) -> Result<()> {
        let vault_id = self.active_vault_id().ok_or(Error::VaultLocked)?;
        self.inner.biometric.revoke_all_keys(&vault_id).await;
        self.inner
            .registry
            .update(&vault_id, RegistryUpdate::BiometricEnabled(false))
            .await
    }

    // ---- backup ----

    /// Export the active vault in the two line backup format.
    pub async fn export_backup(&self, export_password: &[u8]) -> Result<String> {
        let data = self.snapshot().await?;
        let password = Zeroizing::new(export_password.to_vec());
        let kdf = self.inner.config.kdf.clone();
        self.touch().await;
        run_blocking(move || codec::export_backup(&data, &password, &kdf)).await
    }

    /// Replace the active vault's contents with a backup.
    ///
    /// Persisted and rolled back like any other mutation.
    pub async fn restore_backup(&self, text: &str, password: &[u8]) -> Result<()> {
        let text = text.to_string();
        let password = Zeroizing::new(password.to_vec());
        let kdf = self.inner.config.kdf.clone();
        let restored = run_blocking(move || codec::import_backup(&text, &password, &kdf)).await?;
        self.mutate("restore_backup", move |_| Ok(restored)).await
    }

    // ---- readers ----

    async fn with_data<T>(&self, f: impl FnOnce(&VaultData) -> T) -> Result<T> {
        let slot = self.inner.session.read().await;
        let session = slot.as_ref().ok_or(Error::VaultLocked)?;
        Ok(f(&session.snapshot()))
    }

    /// The latest committed data.
    pub async fn snapshot(&self) -> Result<Arc<VaultData>> {
        let slot = self.inner.session.read().await;
        slot.as_ref()
            .map(|s| s.snapshot())
            .ok_or(Error::VaultLocked)
    }

    pub async fn get_entries(&self) -> Result<Vec<Entry>> {
        self.with_data(|d| d.entries.clone()).await
    }

    pub async fn get_entry(&self, entry_id: &str) -> Result<Option<Entry>> {
        self.with_data(|d| d.entry(entry_id).cloned()).await
    }

    pub async fn get_folders(&self) -> Result<Vec<Folder>> {
        self.with_data(|d| d.folders.clone()).await
    }

    pub async fn get_tags(&self) -> Result<Vec<Tag>> {
        self.with_data(|d| d.tags.clone()).await
    }

    pub async fn get_presets(&self) -> Result<Vec<Preset>> {
        self.with_data(|d| d.presets.clone()).await
    }

    pub async fn get_entry_tag_links(&self) -> Result<Vec<EntryTagLink>> {
        self.with_data(|d| d.entry_tags.clone()).await
    }

    pub async fn tags_for_entry(&self, entry_id: &str) -> Result<Vec<Tag>> {
        self.with_data(|d| d.tags_for_entry(entry_id)).await
    }

    pub async fn entries_in_folder(&self, folder_id: &str) -> Result<Vec<Entry>> {
        self.with_data(|d| d.entries_in_folder(folder_id)).await
    }

    pub async fn is_unlocked(&self) -> bool {
        self.inner.session.read().await.is_some()
    }

    pub fn active_vault_id(&self) -> Option<VaultId> {
        self.inner.active_vault.borrow().clone()
    }

    pub async fn session_info(&self) -> Option<SessionInfo> {
        let slot = self.inner.session.read().await;
        slot.as_ref().map(|s| SessionInfo {
            vault_id: s.vault_id().clone(),
            unlocked_at: s.unlocked_at(),
            last_interaction: s.last_interaction(),
        })
    }

    // ---- streams ----

    /// Live data of the active session. The channel closes on lock.
    pub async fn subscribe_data(&self) -> Result<watch::Receiver<Arc<VaultData>>> {
        let slot = self.inner.session.read().await;
        slot.as_ref()
            .map(|s| s.subscribe())
            .ok_or(Error::VaultLocked)
    }

    pub fn subscribe_active_vault(&self) -> watch::Receiver<Option<VaultId>> {
        self.inner.active_vault.subscribe()
    }

    pub fn subscribe_unlock_required(&self) -> broadcast::Receiver<UnlockRequired> {
        self.inner.unlock_required.subscribe()
    }

    pub fn subscribe_biometric(&self) -> broadcast::Receiver<BiometricEvent> {
        self.inner.biometric.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biometric::SoftwareKeystore;
    use passvault_storage::{MemoryRegistry, MemoryStore};

    const PASSWORD: &[u8] = b"correct horse";

    struct Fixture {
        manager: SessionManager,
        store: Arc<MemoryStore>,
        registry: Arc<MemoryRegistry>,
    }

    fn config() -> SessionConfig {
        SessionConfig {
            kdf: KdfParams::testing(),
            ..SessionConfig::default()
        }
    }

    async fn fixture_with(config: SessionConfig, vaults: &[&str]) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(MemoryRegistry::new());
        let manager = SessionManager::new(
            config,
            store.clone(),
            registry.clone(),
            Arc::new(SoftwareKeystore::new()),
        );
        for id in vaults {
            manager
                .create_vault_with_id(
                    VaultId::new(*id).unwrap(),
                    id,
                    StorageLocation::Handle(id.to_string()),
                    PASSWORD,
                )
                .await
                .unwrap();
        }
        Fixture {
            manager,
            store,
            registry,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(config(), &["v1"]).await
    }

    fn v(id: &str) -> VaultId {
        VaultId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_unlock_and_lock() {
        let f = fixture().await;
        let mut unlock_required = f.manager.subscribe_unlock_required();

        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        assert!(f.manager.is_unlocked().await);
        assert_eq!(f.manager.active_vault_id(), Some(v("v1")));
        assert!(f.registry.get(&v("v1")).await.unwrap().unwrap().is_loaded);

        f.manager.lock().await;
        assert!(!f.manager.is_unlocked().await);
        assert_eq!(f.manager.active_vault_id(), None);
        assert!(!f.registry.get(&v("v1")).await.unwrap().unwrap().is_loaded);
        assert_eq!(
            unlock_required.recv().await.unwrap(),
            UnlockRequired {
                vault_id: v("v1"),
                reason: LockReason::Manual
            }
        );
    }

    #[tokio::test]
    async fn test_lock_without_session_is_noop() {
        let f = fixture().await;
        f.manager.lock().await;
        f.manager.lock().await;
        assert!(!f.manager.is_unlocked().await);
    }

    #[tokio::test]
    async fn test_unlock_unknown_vault_does_not_count() {
        let f = fixture().await;
        let result = f.manager.unlock(&v("ghost"), PASSWORD).await;

        assert!(matches!(result, Err(Error::VaultNotFound(_))));
        assert_eq!(
            f.manager.rate_limiter().state(&v("ghost")).failed_attempts,
            0
        );
    }

    #[tokio::test]
    async fn test_wrong_password_counts_as_failure() {
        let f = fixture().await;
        let result = f.manager.unlock(&v("v1"), b"wrong").await;

        assert!(matches!(result, Err(Error::DecryptionFailed)));
        assert!(!f.manager.is_unlocked().await);
        assert_eq!(
            f.manager.rate_limiter().state(&v("v1")).failed_attempts,
            1
        );
    }

    #[tokio::test]
    async fn test_load_errors_are_distinct() {
        let f = fixture().await;
        let loc = StorageLocation::Handle("v1".to_string());

        f.store.set_fail_reads(true);
        assert!(matches!(
            f.manager.unlock(&v("v1"), PASSWORD).await,
            Err(Error::FileAccess(_))
        ));
        f.store.set_fail_reads(false);

        f.store.put_raw(&loc, b"garbage".to_vec()).await;
        assert!(matches!(
            f.manager.unlock(&v("v1"), PASSWORD).await,
            Err(Error::InvalidFileFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_unlock_same_vault_is_idempotent() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        let first = f.manager.session_info().await.unwrap();

        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        let second = f.manager.session_info().await.unwrap();

        assert_eq!(first.unlocked_at, second.unlocked_at);
    }

    #[tokio::test]
    async fn test_mutation_requires_session() {
        let f = fixture().await;
        assert!(matches!(
            f.manager.add_entry(Entry::new("e1", "Bank")).await,
            Err(Error::VaultLocked)
        ));
        assert!(matches!(f.manager.get_entries().await, Err(Error::VaultLocked)));
    }

    #[tokio::test]
    async fn test_save_failure_rolls_back() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        f.manager.add_entry(Entry::new("e1", "Bank")).await.unwrap();
        let before = f.manager.snapshot().await.unwrap();

        f.store.set_fail_writes(true);
        let result = f.manager.add_entry(Entry::new("e2", "Mail")).await;

        assert!(matches!(result, Err(Error::SaveFailed(_))));
        assert_eq!(f.manager.snapshot().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_cancelled_mutation_rolls_back() {
        /// Store whose writes never complete.
        struct StallingStore;

        #[async_trait::async_trait]
        impl VaultStore for StallingStore {
            fn name(&self) -> &str {
                "stalling"
            }
            async fn read(&self, _: &StorageLocation) -> Result<Vec<u8>> {
                Err(Error::FileAccess("unused".to_string()))
            }
            async fn write(&self, _: &StorageLocation, _: Vec<u8>) -> Result<u64> {
                std::future::pending().await
            }
            async fn exists(&self, _: &StorageLocation) -> Result<bool> {
                Ok(false)
            }
            async fn size(&self, _: &StorageLocation) -> Result<u64> {
                Ok(0)
            }
            async fn delete(&self, _: &StorageLocation) -> Result<()> {
                Ok(())
            }
        }

        let manager = SessionManager::new(
            config(),
            Arc::new(StallingStore),
            Arc::new(MemoryRegistry::new()),
            Arc::new(SoftwareKeystore::new()),
        );
        let salt = Salt::generate();
        let session = VaultSession::new(
            v("v1"),
            StorageLocation::Handle("v1".to_string()),
            MasterKey::generate(),
            VaultFileHeader::new(&salt, KdfParams::testing()),
            salt,
            VaultData::new(),
        );
        *manager.inner.session.write().await = Some(session);
        let rx = manager.subscribe_data().await.unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            manager.add_entry(Entry::new("e1", "Bank")),
        )
        .await;

        assert!(result.is_err());
        // The optimistic update was published, then undone on drop.
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow().entries.is_empty());
        assert!(manager.get_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_noop_update_skips_write() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        f.manager.add_entry(Entry::new("e1", "Bank")).await.unwrap();
        let writes = f.store.write_count();

        let same = f.manager.get_entry("e1").await.unwrap().unwrap();
        f.manager.update_entry(same).await.unwrap();

        assert_eq!(f.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_mutation_persists_to_store() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        f.manager.add_entry(Entry::new("e1", "Bank")).await.unwrap();
        f.manager.lock().await;

        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        assert_eq!(f.manager.get_entries().await.unwrap().len(), 1);

        let stats = f.registry.get(&v("v1")).await.unwrap().unwrap().stats;
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_committed_data() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        let mut rx = f.manager.subscribe_data().await.unwrap();

        f.manager.add_entry(Entry::new("e1", "Bank")).await.unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_change_password_rekeys_vault() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        let old_salt = f.manager.inner.session.read().await.as_ref().unwrap().salt().clone();

        f.manager
            .change_master_password(PASSWORD, b"new password")
            .await
            .unwrap();

        let new_salt = f.manager.inner.session.read().await.as_ref().unwrap().salt().clone();
        assert_ne!(old_salt, new_salt);

        f.manager.lock().await;
        assert!(matches!(
            f.manager.unlock(&v("v1"), PASSWORD).await,
            Err(Error::DecryptionFailed)
        ));
        f.manager.unlock(&v("v1"), b"new password").await.unwrap();
    }

    #[tokio::test]
    async fn test_change_password_save_failure_keeps_old_key() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();

        f.store.set_fail_writes(true);
        let result = f
            .manager
            .change_master_password(PASSWORD, b"new password")
            .await;
        assert!(matches!(result, Err(Error::SaveFailed(_))));
        f.store.set_fail_writes(false);

        f.manager.lock().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
    }

    #[tokio::test]
    async fn test_export_and_restore() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        f.manager.add_entry(Entry::new("e1", "Bank")).await.unwrap();

        let backup = f.manager.export_backup(b"backup").await.unwrap();
        f.manager.delete_entry("e1").await.unwrap();
        assert!(f.manager.get_entries().await.unwrap().is_empty());

        f.manager.restore_backup(&backup, b"backup").await.unwrap();
        assert_eq!(f.manager.get_entries().await.unwrap().len(), 1);

        assert!(matches!(
            f.manager.restore_backup(&backup, b"nope").await,
            Err(Error::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn test_create_vault_rejects_existing_location() {
        let f = fixture().await;
        let result = f
            .manager
            .create_vault("Other", StorageLocation::Handle("v1".to_string()), PASSWORD)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_remove_active_vault() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();

        f.manager.remove_vault(&v("v1")).await.unwrap();

        assert!(!f.manager.is_unlocked().await);
        assert!(f.manager.list_vaults().await.unwrap().is_empty());
        assert!(f
            .store
            .raw(&StorageLocation::Handle("v1".to_string()))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_biometric_unlock() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        assert_eq!(f.manager.enable_biometric(PASSWORD).await.unwrap(), 1);
        f.manager.lock().await;

        f.manager.unlock_with_biometric(&v("v1")).await.unwrap();
        assert!(f.manager.is_unlocked().await);
        let history = f.manager.biometric().history(&v("v1")).await;
        assert!(history[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_enable_biometric_wrong_password() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();

        assert!(matches!(
            f.manager.enable_biometric(b"wrong").await,
            Err(Error::AuthenticationFailed)
        ));
        assert!(!f.manager.biometric().is_enabled(&v("v1")).await);
    }

    #[tokio::test]
    async fn test_disable_biometric() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        f.manager.enable_biometric(PASSWORD).await.unwrap();

        f.manager.disable_biometric().await.unwrap();
        f.manager.lock().await;

        assert!(matches!(
            f.manager.unlock_with_biometric(&v("v1")).await,
            Err(Error::Biometric(_))
        ));
    }

    #[tokio::test]
    async fn test_touch_updates_last_interaction() {
        let f = fixture().await;
        f.manager.unlock(&v("v1"), PASSWORD).await.unwrap();
        let before = f.manager.session_info().await.unwrap().last_interaction;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.manager.touch().await;

        let after = f.manager.session_info().await.unwrap().last_interaction;
        assert!(after > before);
    }
}
