//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};

use crate::keys::KEY_LENGTH;
use passvault_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Generate a random nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut out = [0u8; NONCE_SIZE];
    out.copy_from_slice(&nonce);
    out
}

/// Encrypt plaintext using XChaCha20-Poly1305.
///
/// # Postconditions
/// - Returns nonce || ciphertext || tag
/// - The nonce is randomly generated
///
/// # Errors
/// - Returns error if key length is incorrect
/// - Returns error if encryption fails
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = generate_nonce();
    let ciphertext = encrypt_with_nonce(key, &nonce, plaintext)?;

    // Prepend nonce to ciphertext
    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt ciphertext using XChaCha20-Poly1305.
///
/// Ciphertext format: nonce || encrypted_data || tag
///
/// # Errors
/// - `InvalidFileFormat` if the input is too short to hold a nonce and tag
/// - `DecryptionFailed` if authentication fails (wrong key or tampered data)
pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::InvalidFileFormat("Ciphertext too short".to_string()));
    }

    let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_SIZE);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(nonce_bytes);

    decrypt_with_nonce(key, &nonce, encrypted)
}

/// Encrypt plaintext with a caller-supplied nonce.
///
/// Used where the nonce is stored apart from the ciphertext, as in the
/// backup export format. The caller must never reuse a nonce under the
/// same key.
pub fn encrypt_with_nonce(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce_array = GenericArray::from_slice(nonce);

    cipher
        .encrypt(nonce_array, plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
}

/// Decrypt ciphertext (encrypted_data || tag) with a specific nonce.
pub fn decrypt_with_nonce(
    key: &[u8],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::InvalidFileFormat("Ciphertext too short".to_string()));
    }

    let cipher = cipher_for(key)?;
    let nonce_array = GenericArray::from_slice(nonce);

    cipher
        .decrypt(nonce_array, ciphertext)
        .map_err(|_| Error::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Hello, World!";

        let ciphertext = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &ciphertext).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_ciphertext_size() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Test message";

        let ciphertext = encrypt(&key, plaintext).unwrap();

        assert_eq!(ciphertext.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);
    }

    #[test]
    fn test_different_nonce_each_time() {
        let key = [42u8; KEY_LENGTH];
        let plaintext = b"Same plaintext";

        let ct1 = encrypt(&key, plaintext).unwrap();
        let ct2 = encrypt(&key, plaintext).unwrap();

        assert_ne!(&ct1[..NONCE_SIZE], &ct2[..NONCE_SIZE]);
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_wrong_key_is_decryption_failure() {
        let key1 = [1u8; KEY_LENGTH];
        let key2 = [2u8; KEY_LENGTH];

        let ciphertext = encrypt(&key1, b"Secret data").unwrap();

        assert!(matches!(
            decrypt(&key2, &ciphertext),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_is_decryption_failure() {
        let key = [42u8; KEY_LENGTH];

        let mut ciphertext = encrypt(&key, b"Important data").unwrap();
        ciphertext[NONCE_SIZE + 5] ^= 0xFF;

        assert!(matches!(
            decrypt(&key, &ciphertext),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_ciphertext_is_format_error() {
        let key = [42u8; KEY_LENGTH];
        assert!(matches!(
            decrypt(&key, &[0u8; 10]),
            Err(Error::InvalidFileFormat(_))
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        let short_key = [0u8; 16];
        assert!(matches!(
            encrypt(&short_key, b"data"),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn test_encrypt_with_nonce() {
        let key = [42u8; KEY_LENGTH];
        let nonce = [1u8; NONCE_SIZE];
        let plaintext = b"Deterministic";

        let ct1 = encrypt_with_nonce(&key, &nonce, plaintext).unwrap();
        let ct2 = encrypt_with_nonce(&key, &nonce, plaintext).unwrap();

        assert_eq!(ct1, ct2);

        let decrypted = decrypt_with_nonce(&key, &nonce, &ct1).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = [42u8; KEY_LENGTH];

        let ciphertext = encrypt(&key, b"").unwrap();
        let decrypted = decrypt(&key, &ciphertext).unwrap();

        assert!(decrypted.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_any_single_bit_flip_is_rejected(
            plaintext in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256),
            byte in 0usize..1024,
            bit in 0u8..8,
        ) {
            let key = [7u8; KEY_LENGTH];
            let mut ciphertext = encrypt(&key, &plaintext).unwrap();
            let index = byte % ciphertext.len();
            ciphertext[index] ^= 1 << bit;

            proptest::prop_assert!(decrypt(&key, &ciphertext).is_err());
        }
    }
}
