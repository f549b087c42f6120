//! On-disk vault container.
//!
//! ```text
//! +------+----------------+-------------+------------------------------+
//! | PVLT | header len u32 | header JSON | nonce || ciphertext || tag   |
//! +------+----------------+-------------+------------------------------+
//! ```
//!
//! The header is plaintext: it carries only what is needed to derive the
//! key (format version, KDF identifier and parameters, salt).

use serde::{Deserialize, Serialize};

use passvault_common::{Error, Result};
use passvault_crypto::{KdfParams, Salt, KDF_ALGORITHM};

/// Magic bytes at the start of every vault file.
pub const MAGIC: &[u8; 4] = b"PVLT";

/// Upper bound on the header size; anything larger is not ours.
const MAX_HEADER_LEN: usize = 64 * 1024;

/// Vault format version for migration support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultVersion {
    pub major: u32,
    pub minor: u32,
}

impl VaultVersion {
    /// Current vault format version.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Check if this version is compatible with the current version.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl Default for VaultVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Plaintext header stored in front of the encrypted payload.
///
/// Mutated only when the master password changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultFileHeader {
    /// Vault format version.
    pub version: VaultVersion,
    /// KDF algorithm identifier.
    pub kdf_algorithm: String,
    /// KDF parameters.
    pub kdf_params: KdfParams,
    /// Hex-encoded KDF salt.
    pub salt: String,
}

impl VaultFileHeader {
    /// Build a header for a freshly generated salt.
    pub fn new(salt: &Salt, kdf_params: KdfParams) -> Self {
        Self {
            version: VaultVersion::CURRENT,
            kdf_algorithm: KDF_ALGORITHM.to_string(),
            kdf_params,
            salt: salt.to_hex(),
        }
    }

    /// Decode the salt.
    pub fn salt(&self) -> Result<Salt> {
        Salt::from_hex(&self.salt)
    }

    /// Check the header describes something this build can open.
    pub fn validate(&self) -> Result<()> {
        if !self.version.is_compatible() {
            return Err(Error::InvalidFileFormat(format!(
                "Incompatible vault version: {}.{}",
                self.version.major, self.version.minor
            )));
        }
        if self.kdf_algorithm != KDF_ALGORITHM {
            return Err(Error::InvalidFileFormat(format!(
                "Unsupported KDF: {}",
                self.kdf_algorithm
            )));
        }
        self.salt()?;
        Ok(())
    }
}

/// A parsed vault file: header plus opaque AEAD payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultFile {
    pub header: VaultFileHeader,
    pub payload: Vec<u8>,
}

impl VaultFile {
    /// Serialize to the container layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| Error::Serialization("Header too large".to_string()))?;

        let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + self.payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Parse the container layout.
    ///
    /// # Errors
    /// - `InvalidFileFormat` for a missing magic, a truncated file, an
    ///   unparseable or incompatible header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let rest = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| Error::InvalidFileFormat("Not a vault file".to_string()))?;

        if rest.len() < 4 {
            return Err(Error::InvalidFileFormat("Truncated header".to_string()));
        }
        let (len_bytes, rest) = rest.split_at(4);
        let mut len_array = [0u8; 4];
        len_array.copy_from_slice(len_bytes);
        let header_len = u32::from_le_bytes(len_array) as usize;

        if header_len > MAX_HEADER_LEN || header_len > rest.len() {
            return Err(Error::InvalidFileFormat("Truncated header".to_string()));
        }
        let (header_bytes, payload) = rest.split_at(header_len);

        let header: VaultFileHeader = serde_json::from_slice(header_bytes)
            .map_err(|e| Error::InvalidFileFormat(format!("Malformed header: {}", e)))?;
        header.validate()?;

        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }
}
