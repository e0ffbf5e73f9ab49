//! Per-installation symmetric key and the envelope format used for everything
//! written to disk.
//!
//! Encrypted payloads are stored as `RSENC1:` followed by base64 of the
//! 24-byte nonce and the XChaCha20-Poly1305 ciphertext. Anything without the
//! prefix is plaintext, which lets a reader decide whether to decrypt.
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{Error, Result};

pub const ENVELOPE_PREFIX: &str = "RSENC1:";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

#[derive(Clone)]
pub struct CacheKey([u8; KEY_LEN]);

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CacheKey(..)")
    }
}

impl CacheKey {
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Reads the key at `path`, generating and persisting a new one on first run.
    /// A key file is never rewritten once it exists.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(key) => Ok(key),
            Err(Error::NotFound) => {
                let key = Self::generate();
                key.persist(path)?;
                tracing::info!("Generated new cache key at {}", path.display());
                Ok(key)
            }
            Err(e) => Err(e),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let encoded = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(e.into()),
        };

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Integrity(format!("key file is not valid base64: {e}")))?;
        let bytes: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|_| Error::Integrity("key file has the wrong length".to_string()))?;
        Ok(Self(bytes))
    }

    fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path)?;
        file.write_all(STANDARD.encode(self.0).as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

/// Wraps payloads for disk, encrypting when a key is configured.
#[derive(Debug, Clone)]
pub struct Envelope {
    key: Option<CacheKey>,
}

impl Envelope {
    #[must_use]
    pub fn encrypted(key: CacheKey) -> Self {
        Self { key: Some(key) }
    }

    #[must_use]
    pub fn plaintext() -> Self {
        Self { key: None }
    }

    #[must_use]
    pub fn is_encrypted(payload: &str) -> bool {
        payload.starts_with(ENVELOPE_PREFIX)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let Some(key) = &self.key else {
            return String::from_utf8(plaintext.to_vec())
                .map_err(|e| Error::Serialization(e.to_string()));
        };

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = key
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Integrity(format!("could not encrypt payload: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        Ok(format!("{ENVELOPE_PREFIX}{}", STANDARD.encode(blob)))
    }

    /// Returns the plaintext of `payload`, decrypting if it carries the prefix.
    pub fn open(&self, payload: &str) -> Result<Vec<u8>> {
        let Some(encoded) = payload.strip_prefix(ENVELOPE_PREFIX) else {
            return Ok(payload.as_bytes().to_vec());
        };

        let key = self.key.as_ref().ok_or_else(|| {
            Error::Integrity("payload is encrypted but no cache key is available".to_string())
        })?;

        let blob = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Integrity(format!("envelope is not valid base64: {e}")))?;
        if blob.len() < NONCE_LEN {
            return Err(Error::Integrity("envelope is truncated".to_string()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        key.cipher()
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Integrity("could not decrypt payload".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_seal_and_open() {
        let envelope = Envelope::encrypted(CacheKey::from_bytes([7; 32]));
        let sealed = envelope.seal(b"{\"hello\":\"roster\"}").unwrap();

        assert!(Envelope::is_encrypted(&sealed));
        assert!(!sealed.contains("roster"));
        assert_eq!(envelope.open(&sealed).unwrap(), b"{\"hello\":\"roster\"}");
    }

    #[test]
    fn test_plaintext_passthrough() {
        let envelope = Envelope::encrypted(CacheKey::from_bytes([7; 32]));
        assert_eq!(envelope.open("{}").unwrap(), b"{}");

        let plain = Envelope::plaintext();
        let sealed = plain.seal(b"{}").unwrap();
        assert_eq!(sealed, "{}");
    }

    #[test]
    fn test_wrong_key_is_integrity_error() {
        let sealed = Envelope::encrypted(CacheKey::from_bytes([1; 32]))
            .seal(b"secret")
            .unwrap();
        let other = Envelope::encrypted(CacheKey::from_bytes([2; 32]));
        assert!(matches!(other.open(&sealed), Err(Error::Integrity(_))));
        assert!(matches!(
            Envelope::plaintext().open(&sealed),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("keys").join("cache.key");

        let first = CacheKey::load_or_create(&path).unwrap();
        let second = CacheKey::load_or_create(&path).unwrap();
        assert_eq!(first.0, second.0);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_persist_never_replaces_an_existing_key() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.key");
        fs::write(&path, "existing").unwrap();

        assert!(CacheKey::generate().persist(&path).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "existing");
    }

    #[test]
    fn test_corrupt_key_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.key");
        fs::write(&path, "not-a-key").unwrap();
        assert!(matches!(CacheKey::load(&path), Err(Error::Integrity(_))));
    }
}
