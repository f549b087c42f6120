//! Payload encoding for the live vault file and the backup export format.
//!
//! The live vault is a `VaultFile` container whose payload is the JSON
//! serialized `VaultData` sealed under the master key. The backup export
//! is a two line text file:
//!
//! ```text
//! PASSVAULT-EXPORT-V1
//! <salt hex>:<nonce hex>:<ciphertext hex>
//! ```

use zeroize::Zeroizing;

use crate::model::VaultData;
use passvault_common::{Error, Result};
use passvault_crypto::{
    decrypt, decrypt_with_nonce, derive_key, encrypt, encrypt_with_nonce, generate_nonce,
    KdfParams, MasterKey, Salt, NONCE_SIZE,
};
use passvault_storage::{VaultFile, VaultFileHeader};

/// First line of every backup export.
pub const EXPORT_MAGIC: &str = "PASSVAULT-EXPORT-V1";

fn to_plaintext(data: &VaultData) -> Result<Zeroizing<Vec<u8>>> {
    serde_json::to_vec(data)
        .map(Zeroizing::new)
        .map_err(|e| Error::Serialization(e.to_string()))
}

fn from_plaintext(plaintext: &[u8]) -> Result<VaultData> {
    let data: VaultData = serde_json::from_slice(plaintext)
        .map_err(|_| Error::InvalidFileFormat("Payload is not vault data".to_string()))?;
    data.validate()?;
    Ok(data)
}

/// Encrypt `data` under `key` and wrap it in a container with `header`.
pub fn seal(data: &VaultData, key: &MasterKey, header: &VaultFileHeader) -> Result<Vec<u8>> {
    let plaintext = to_plaintext(data)?;
    let payload = encrypt(key.as_bytes(), &plaintext)?;

    VaultFile {
        header: header.clone(),
        payload,
    }
    .to_bytes()
}

/// Decrypt the payload of a parsed container.
///
/// # Errors
/// - `DecryptionFailed` on a wrong key or tampered payload
/// - `InvalidFileFormat` if the plaintext is not valid vault data
pub fn open(file: &VaultFile, key: &MasterKey) -> Result<VaultData> {
    let plaintext = Zeroizing::new(decrypt(key.as_bytes(), &file.payload)?);
    from_plaintext(&plaintext)
}

/// Render `data` in the backup export format.
///
/// A fresh salt and nonce are generated for every export.
pub fn export_backup(data: &VaultData, password: &[u8], params: &KdfParams) -> Result<String> {
    let salt = Salt::generate();
    let key = derive_key(password, &salt, params)?;
    let nonce = generate_nonce();

    let plaintext = to_plaintext(data)?;
    let ciphertext = encrypt_with_nonce(key.as_bytes(), &nonce, &plaintext)?;

    Ok(format!(
        "{}\n{}:{}:{}\n",
        EXPORT_MAGIC,
        salt.to_hex(),
        hex::encode(nonce),
        hex::encode(ciphertext)
    ))
}

/// Parse and decrypt a backup export.
///
/// # Errors
/// - `InvalidFileFormat` if the text is not an export
/// - `DecryptionFailed` if the password is wrong
pub fn import_backup(text: &str, password: &[u8], params: &KdfParams) -> Result<VaultData> {
    let mut lines = text.lines();
    if lines.next().map(str::trim) != Some(EXPORT_MAGIC) {
        return Err(Error::InvalidFileFormat("Not a vault export".to_string()));
    }
    let body = lines
        .next()
        .map(str::trim)
        .ok_or_else(|| Error::InvalidFileFormat("Missing export body".to_string()))?;

    let parts: Vec<&str> = body.split(':').collect();
    let [salt_hex, nonce_hex, ct_hex] = parts.as_slice() else {
        return Err(Error::InvalidFileFormat("Malformed export body".to_string()));
    };

    let salt = Salt::from_hex(salt_hex)?;
    let nonce: [u8; NONCE_SIZE] = hex::decode(nonce_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::InvalidFileFormat("Malformed export nonce".to_string()))?;
    let ciphertext = hex::decode(ct_hex)
        .map_err(|_| Error::InvalidFileFormat("Malformed export ciphertext".to_string()))?;

    let key = derive_key(password, &salt, params)?;
    let plaintext = Zeroizing::new(decrypt_with_nonce(key.as_bytes(), &nonce, &ciphertext)?);
    from_plaintext(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entry, Folder, Tag};
    use passvault_crypto::SALT_LENGTH;
    use proptest::prelude::*;

    fn header() -> VaultFileHeader {
        VaultFileHeader::new(&Salt::generate(), KdfParams::testing())
    }

    fn sample() -> VaultData {
        VaultData::new()
            .with_folder_added(Folder::new("f1", "Work"))
            .unwrap()
            .with_tag_added(Tag::new("t1", "2fa"))
            .unwrap()
            .with_entry_added(
                Entry::new("e1", "Mail")
                    .with_username("alice")
                    .with_password("hunter2")
                    .in_folder("f1"),
            )
            .unwrap()
            .with_entry_added(Entry::new("e2", "Bare"))
            .unwrap()
            .with_tag_linked("e1", "t1")
            .unwrap()
    }

    #[test]
    fn test_seal_and_open() {
        let key = MasterKey::generate();
        let data = sample();

        let bytes = seal(&data, &key, &header()).unwrap();
        let file = VaultFile::from_bytes(&bytes).unwrap();

        assert_eq!(open(&file, &key).unwrap(), data);
    }

    #[test]
    fn test_open_with_wrong_key() {
        let bytes = seal(&sample(), &MasterKey::generate(), &header()).unwrap();
        let file = VaultFile::from_bytes(&bytes).unwrap();

        assert!(matches!(
            open(&file, &MasterKey::generate()),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_tampered_payload_is_decryption_failure() {
        let key = MasterKey::generate();
        let bytes = seal(&sample(), &key, &header()).unwrap();
        let mut file = VaultFile::from_bytes(&bytes).unwrap();
        let last = file.payload.len() - 1;
        file.payload[last] ^= 0x01;

        assert!(matches!(open(&file, &key), Err(Error::DecryptionFailed)));
    }

    #[test]
    fn test_non_vault_plaintext_is_invalid_format() {
        let key = MasterKey::generate();
        let file = VaultFile {
            header: header(),
            payload: encrypt(key.as_bytes(), b"[1, 2, 3]").unwrap(),
        };

        assert!(matches!(open(&file, &key), Err(Error::InvalidFileFormat(_))));
    }

    #[test]
    fn test_dangling_reference_is_invalid_format() {
        let key = MasterKey::generate();
        let mut data = sample();
        data.folders.clear();
        let file = VaultFile {
            header: header(),
            payload: encrypt(key.as_bytes(), &serde_json::to_vec(&data).unwrap()).unwrap(),
        };

        assert!(matches!(open(&file, &key), Err(Error::InvalidFileFormat(_))));
    }

    #[test]
    fn test_export_layout() {
        let text = export_backup(&sample(), b"export-pw", &KdfParams::testing()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], EXPORT_MAGIC);
        let parts: Vec<&str> = lines[1].split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), SALT_LENGTH * 2);
        assert_eq!(parts[1].len(), NONCE_SIZE * 2);
    }

    #[test]
    fn test_export_preserves_contents() {
        let params = KdfParams::testing();
        let data = sample();
        let text = export_backup(&data, b"export-pw", &params).unwrap();

        assert_eq!(import_backup(&text, b"export-pw", &params).unwrap(), data);
        assert!(matches!(
            import_backup(&text, b"wrong", &params),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_import_rejects_foreign_text() {
        let params = KdfParams::testing();
        assert!(matches!(
            import_backup("hello\nworld", b"pw", &params),
            Err(Error::InvalidFileFormat(_))
        ));
        assert!(matches!(
            import_backup(&format!("{}\nzz:00:00", EXPORT_MAGIC), b"pw", &params),
            Err(Error::InvalidFileFormat(_))
        ));
        assert!(matches!(
            import_backup(EXPORT_MAGIC, b"pw", &params),
            Err(Error::InvalidFileFormat(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_seal_open_preserves_data(
            titles in proptest::collection::vec("[a-zA-Z0-9 ]{0,16}", 1..8),
            with_fields in proptest::collection::vec(any::<bool>(), 8),
        ) {
            let mut data = VaultData::new();
            for (i, title) in titles.iter().enumerate() {
                let mut entry = Entry::new(format!("e{}", i), title.clone());
                if with_fields[i] {
                    entry.username = Some(String::new());
                    entry.notes = Some(title.clone());
                }
                data = data.with_entry_added(entry).unwrap();
            }

            let key = MasterKey::generate();
            let bytes = seal(&data, &key, &header()).unwrap();
            let file = VaultFile::from_bytes(&bytes).unwrap();
            prop_assert_eq!(open(&file, &key).unwrap(), data);
        }
    }
}
