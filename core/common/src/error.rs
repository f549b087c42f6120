//! Common error types for PassVault.
//!
//! The variants form a closed taxonomy: every failure the engine can
//! surface to a caller maps onto exactly one of them. Unrecoverable
//! faults (allocation failure, stack exhaustion, panics) are never
//! represented here and propagate to the process-level handler.

use thiserror::Error;

/// Top-level error type for PassVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The vault is not present in the registry.
    #[error("Vault not found: {0}")]
    VaultNotFound(String),

    /// Unlock attempts are throttled for this vault.
    #[error("Too many attempts, retry in {seconds_remaining} seconds")]
    TooManyAttempts { seconds_remaining: u64 },

    /// Wrong password or tampered ciphertext.
    ///
    /// The two causes are deliberately indistinguishable.
    #[error("Decryption failed")]
    DecryptionFailed,

    /// The vault file could not be read or written.
    #[error("File access error: {0}")]
    FileAccess(String),

    /// The vault file is not a well-formed vault container.
    #[error("Invalid file format: {0}")]
    InvalidFileFormat(String),

    /// Persisting a mutation failed; the in-memory state was rolled back.
    #[error("Save failed: {0}")]
    SaveFailed(String),

    /// An entry with this id already exists.
    #[error("Entry already exists: {0}")]
    EntryAlreadyExists(String),

    /// No entry with this id exists.
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// A folder with this id already exists.
    #[error("Folder already exists: {0}")]
    FolderAlreadyExists(String),

    /// No folder with this id exists.
    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    /// A tag with this id already exists.
    #[error("Tag already exists: {0}")]
    TagAlreadyExists(String),

    /// No tag with this id exists.
    #[error("Tag not found: {0}")]
    TagNotFound(String),

    /// A preset with this id already exists.
    #[error("Preset already exists: {0}")]
    PresetAlreadyExists(String),

    /// No preset with this id exists.
    #[error("Preset not found: {0}")]
    PresetNotFound(String),

    /// A supplied password did not match the unlocked session.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The operation requires an unlocked vault.
    #[error("Vault is locked")]
    VaultLocked,

    /// Biometric key management failed.
    #[error("Biometric error: {0}")]
    Biometric(String),

    /// Cryptographic operation failed for a reason other than authentication.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Unexpected fault, message preserved for diagnostics.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    /// Whether this is a domain rule violation rather than an
    /// infrastructure failure.
    ///
    /// Domain errors abort the operation without logging; infrastructure
    /// errors are additionally logged with redacted identifiers.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::EntryAlreadyExists(_)
                | Error::EntryNotFound(_)
                | Error::FolderAlreadyExists(_)
                | Error::FolderNotFound(_)
                | Error::TagAlreadyExists(_)
                | Error::TagNotFound(_)
                | Error::PresetAlreadyExists(_)
                | Error::PresetNotFound(_)
                | Error::AuthenticationFailed
                | Error::DecryptionFailed
                | Error::InvalidInput(_)
        )
    }

    /// Message safe to show to a user after a failed unlock.
    ///
    /// Only throttling is reported specifically; every other cause reads
    /// the same so that wrong passwords and corrupt files cannot be told
    /// apart from the outside.
    pub fn user_message(&self) -> String {
        match self {
            Error::TooManyAttempts { seconds_remaining } => format!(
                "Too many attempts, retry in {} seconds",
                seconds_remaining
            ),
            _ => "Could not unlock the vault".to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::FileAccess(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
