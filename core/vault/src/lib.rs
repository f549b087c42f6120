//! Vault session engine for PassVault.
//!
//! This module provides:
//! - The decrypted vault data model and its copy-on-write mutators
//! - Payload encryption and the backup export format
//! - Unlock rate limiting and biometric key management
//! - The session manager: unlock/lock state machine, serialized
//!   mutation pipeline with rollback, and the auto-lock scheduler
//!
//! # Architecture
//! The session manager is the only owner of the decrypted vault. Callers
//! hold a cheap, cloneable `SessionManager` handle; every mutation goes
//! through one pipeline that persists before it commits.

mod autolock;
pub mod biometric;
pub mod codec;
pub mod config;
pub mod events;
pub mod manager;
pub mod model;
pub mod rate_limit;
pub mod session;

pub use biometric::{BiometricKeyManager, BiometricKeyMetadata, SecureKeystore, SoftwareKeystore};
pub use config::{RateLimitConfig, SessionConfig};
pub use events::{BiometricEvent, LockReason, UnlockRequired};
pub use manager::{SessionInfo, SessionManager};
pub use model::{Entry, EntryTagLink, Folder, Preset, PresetMode, Tag, VaultData};
pub use rate_limit::{AttemptDecision, AttemptGuard, RateLimitState, UnlockRateLimiter};
pub use session::{SessionHandle, VaultSession};
