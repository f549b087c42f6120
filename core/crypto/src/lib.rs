//! Cryptographic primitives for PassVault.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Key and salt types with automatic zeroization
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Key comparisons run in constant time

pub mod aead;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt, decrypt_with_nonce, encrypt, encrypt_with_nonce, generate_nonce, NONCE_SIZE};
pub use kdf::{derive_key, keys_match, verify_password, KdfParams, KDF_ALGORITHM};
pub use keys::{random_bytes, MasterKey, Salt, KEY_LENGTH, SALT_LENGTH};
