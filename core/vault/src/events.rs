//! Event types published by the session manager.

use passvault_common::VaultId;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    /// `lock()` was called.
    Manual,
    /// The inactivity timer fired while the app was in the background.
    AutoLock,
    /// Another vault was unlocked.
    VaultSwitch,
    /// The vault was removed.
    Removed,
}

/// Emitted whenever a session ends, so a UI can prompt for unlock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockRequired {
    pub vault_id: VaultId,
    pub reason: LockReason,
}

/// Biometric key rotation lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BiometricEvent {
    /// The active key is older than the rotation threshold.
    RotationNeeded { vault_id: VaultId },
    /// A new key version replaced the previous one.
    RotationCompleted { vault_id: VaultId, new_version: u32 },
    /// Rotation was attempted and the previous version is still active.
    RotationFailed { vault_id: VaultId, reason: String },
}
