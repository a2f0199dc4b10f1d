//! JSON documents and the encrypted version marker.

use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::warn;

use crate::error::{PatchError, Result};
use crate::version::Version;

const KEY_CONTEXT: &str = "smartpatch 2024 version marker key";
const NONCE_LEN: usize = 12;

pub fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| PatchError::codec("document", e))
}

pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| PatchError::codec(std::any::type_name::<T>(), e))
}

pub fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = encode(value)?;
    crate::fsops::ensure_parent(path)?;
    std::fs::write(path, text).map_err(|e| PatchError::io(path, e))
}

pub fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|e| PatchError::io(path, e))?;
    decode(&text)
}

/// Like [`read_document`], but a missing file yields the default value.
pub fn read_document_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    read_document(path)
}

fn cipher(keyphrase: &str) -> ChaCha20Poly1305 {
    let key = blake3::derive_key(KEY_CONTEXT, keyphrase.as_bytes());
    ChaCha20Poly1305::new(Key::from_slice(&key))
}

/// Encrypt `text` to base64 of `nonce || ciphertext`.
pub fn encrypt(text: &str, keyphrase: &str) -> anyhow::Result<String> {
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher(keyphrase)
        .encrypt(&nonce, text.as_bytes())
        .map_err(|e| anyhow!("Failed to encrypt: {e}"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(sealed))
}

pub fn decrypt(text: &str, keyphrase: &str) -> anyhow::Result<String> {
    let sealed = BASE64
        .decode(text.trim())
        .context("Encrypted text is not valid base64")?;
    if sealed.len() < NONCE_LEN {
        bail!("Encrypted text is too short");
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let plain = cipher(keyphrase)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("Failed to decrypt: wrong keyphrase or corrupted data"))?;
    String::from_utf8(plain).context("Decrypted text is not UTF-8")
}

pub fn write_version_marker(path: &Path, version: &Version, keyphrase: &str) -> Result<()> {
    let sealed = encrypt(&version.to_string(), keyphrase)?;
    crate::fsops::ensure_parent(path)?;
    std::fs::write(path, sealed).map_err(|e| PatchError::io(path, e))
}

/// The installed version, or `None` when the marker is missing or unreadable.
pub fn read_version_marker(path: &Path, keyphrase: &str) -> Option<Version> {
    if !path.exists() {
        return None;
    }

    let parsed = std::fs::read_to_string(path)
        .context("Failed to read version marker")
        .and_then(|sealed| decrypt(&sealed, keyphrase))
        .and_then(|plain| plain.parse::<Version>().map_err(anyhow::Error::from));

    match parsed {
        Ok(version) => Some(version),
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Ignoring unreadable version marker");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{BuildsIndex, PatchIndex, PatchIndexEntry};

    #[test]
    fn test_encrypt_round_trip() {
        let sealed = encrypt("1.2.3", "secret").unwrap();
        assert_ne!(sealed, "1.2.3");
        assert_eq!(decrypt(&sealed, "secret").unwrap(), "1.2.3");
    }

    #[test]
    fn test_nonce_is_fresh_each_time() {
        assert_ne!(encrypt("1.2.3", "k").unwrap(), encrypt("1.2.3", "k").unwrap());
    }

    #[test]
    fn test_wrong_keyphrase_fails() {
        let sealed = encrypt("1.2.3", "secret").unwrap();
        assert!(decrypt(&sealed, "other").is_err());
        assert!(decrypt("not base64!", "secret").is_err());
        assert!(decrypt("AAAA", "secret").is_err());
    }

    #[test]
    fn test_version_marker() {
        let temp = tempfile::tempdir().unwrap();
        let marker = temp.path().join("Game/version.data");
        assert_eq!(read_version_marker(&marker, "k"), None);

        write_version_marker(&marker, &Version::new(2, 0, 1), "k").unwrap();
        assert_eq!(read_version_marker(&marker, "k"), Some(Version::new(2, 0, 1)));
        assert_eq!(read_version_marker(&marker, "wrong"), None);

        std::fs::write(&marker, "garbage").unwrap();
        assert_eq!(read_version_marker(&marker, "k"), None);
    }

    #[test]
    fn test_documents() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("patches/patches_index.json");

        let empty: PatchIndex = read_document_or_default(&path).unwrap();
        assert!(empty.patches.is_empty());

        let index = PatchIndex {
            patches: vec![PatchIndexEntry {
                from: Version::new(1, 0, 0),
                to: Version::new(1, 1, 0),
            }],
        };
        write_document(&path, &index).unwrap();
        let back: PatchIndex = read_document(&path).unwrap();
        assert_eq!(back, index);

        let err = decode::<BuildsIndex>("{ not json").unwrap_err();
        assert!(matches!(err, PatchError::Codec { .. }));
    }
}
