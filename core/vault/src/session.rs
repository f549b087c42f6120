//! The in-memory state of one unlocked vault.
//!
//! A `VaultSession` owns the derived key and the current `VaultData`
//! snapshot. It is created and destroyed only by the `SessionManager`;
//! the key is zeroized and the auto-lock timer aborted when it drops.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::model::VaultData;
use passvault_common::VaultId;
use passvault_crypto::{MasterKey, Salt};
use passvault_storage::{StorageLocation, VaultFileHeader};

/// Session handle for telling sessions apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    /// Generate a new unique session handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the handle string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Active vault session.
pub struct VaultSession {
    handle: SessionHandle,
    vault_id: VaultId,
    location: StorageLocation,
    /// Derived key (zeroized on drop).
    key: MasterKey,
    header: VaultFileHeader,
    salt: Salt,
    data: watch::Sender<Arc<VaultData>>,
    unlocked_at: DateTime<Utc>,
    last_interaction_ms: AtomicI64,
    /// Bumped every time the auto-lock timer is re-armed.
    timer_generation: AtomicU64,
    auto_lock: Mutex<Option<JoinHandle<()>>>,
}

impl VaultSession {
    pub(crate) fn new(
        vault_id: VaultId,
        location: StorageLocation,
        key: MasterKey,
        header: VaultFileHeader,
        salt: Salt,
        data: VaultData,
    ) -> Self {
        let (data, _) = watch::channel(Arc::new(data));
        let now = Utc::now();
        Self {
            handle: SessionHandle::new(),
            vault_id,
            location,
            key,
            header,
            salt,
            data,
            unlocked_at: now,
            last_interaction_ms: AtomicI64::new(now.timestamp_millis()),
            timer_generation: AtomicU64::new(0),
            auto_lock: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn vault_id(&self) -> &VaultId {
        &self.vault_id
    }

    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    pub fn header(&self) -> &VaultFileHeader {
        &self.header
    }

    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    pub(crate) fn key(&self) -> &MasterKey {
        &self.key
    }

    pub fn unlocked_at(&self) -> DateTime<Utc> {
        self.unlocked_at
    }

    pub fn last_interaction(&self) -> DateTime<Utc> {
        let ms = self.last_interaction_ms.load(Ordering::SeqCst);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(self.unlocked_at)
    }

    /// The latest published data.
    pub fn snapshot(&self) -> Arc<VaultData> {
        self.data.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<VaultData>> {
        self.data.subscribe()
    }

    /// Install `data` as the current snapshot and notify subscribers.
    pub(crate) fn publish(&self, data: Arc<VaultData>) {
        self.data.send_replace(data);
    }

    pub(crate) fn touch(&self) {
        self.last_interaction_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.timer_generation.load(Ordering::SeqCst)
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Replace the running auto-lock task, aborting the previous one.
    pub(crate) async fn set_timer(&self, task: JoinHandle<()>) {
        let mut slot = self.auto_lock.lock().await;
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Swap in the key and header produced by a password change.
    pub(crate) fn replace_keys(&mut self, key: MasterKey, header: VaultFileHeader, salt: Salt) {
        // The old key is zeroized when it drops here.
        self.key = key;
        self.header = header;
        self.salt = salt;
    }
}

impl Drop for VaultSession {
    fn drop(&mut self) {
        if let Some(task) = self.auto_lock.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entry;
    use passvault_crypto::KdfParams;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn session() -> VaultSession {
        let salt = Salt::generate();
        VaultSession::new(
            VaultId::new("v1").unwrap(),
            StorageLocation::Handle("v1".to_string()),
            MasterKey::generate(),
            VaultFileHeader::new(&salt, KdfParams::testing()),
            salt,
            VaultData::new(),
        )
    }

    #[test]
    fn test_handles_are_unique() {
        assert_ne!(SessionHandle::new(), SessionHandle::new());
    }

    #[tokio::test]
    async fn test_publish_notifies_subscribers() {
        let session = session();
        let mut rx = session.subscribe();

        let next = VaultData::new()
            .with_entry_added(Entry::new("e1", "Bank"))
            .unwrap();
        session.publish(Arc::new(next.clone()));

        rx.changed().await.unwrap();
        assert_eq!(**rx.borrow(), next);
        assert_eq!(*session.snapshot(), next);
    }

    /// A long sleeping task plus a receiver that resolves once the task
    /// has been dropped.
    fn sleeper() -> (JoinHandle<()>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let _alive = tx;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        (task, rx)
    }

    #[tokio::test]
    async fn test_set_timer_aborts_previous() {
        let session = session();
        let (first, first_dropped) = sleeper();
        session.set_timer(first).await;

        let (second, _second_dropped) = sleeper();
        session.set_timer(second).await;

        assert!(first_dropped.await.is_err());
    }

    #[tokio::test]
    async fn test_drop_aborts_timer() {
        let session = session();
        let (task, dropped) = sleeper();
        session.set_timer(task).await;

        drop(session);
        assert!(dropped.await.is_err());
    }

    #[test]
    fn test_generations_increase() {
        let session = session();
        assert_eq!(session.generation(), 0);
        assert_eq!(session.next_generation(), 1);
        assert_eq!(session.next_generation(), 2);
        assert_eq!(session.generation(), 2);
    }
}
