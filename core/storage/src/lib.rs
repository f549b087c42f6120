//! Vault store I/O and registry for PassVault.
//!
//! This module provides a trait-based interface for reading and writing
//! the opaque encrypted vault file, the on-disk container format that
//! frames the header and ciphertext, and the registry of known vaults.
//!
//! # Design Principles
//! - Stores move opaque bytes; they never see plaintext or keys
//! - Async operations: all I/O operations are async
//! - Unified error semantics: every backend reports `FileAccess`
//!   for I/O failures and `InvalidFileFormat` for malformed containers

pub mod format;
pub mod local;
pub mod memory;
pub mod registry;
pub mod store;

pub use format::{VaultFile, VaultFileHeader, VaultVersion};
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use registry::{
    JsonFileRegistry, MemoryRegistry, RegistryEntry, RegistryUpdate, VaultRegistry, VaultStats,
};
pub use store::{StorageLocation, VaultStore};
