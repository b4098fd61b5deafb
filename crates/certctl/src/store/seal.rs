//! Encryption of key material at rest.
//!
//! Keys are sealed with AES-256-GCM under a store-wide master key. The
//! additional authenticated data binds each envelope to the name it was
//! sealed for, so an envelope copied to another slot fails to open.

use std::fs;
use std::path::Path;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use super::error::StoreError;

/// Encryption scheme recorded in `store.json`.
pub const KEY_ENCRYPTION: &str = "aes-256-gcm";

/// Envelope format version.
pub const SEAL_VERSION: u32 = 1;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

/// Where the master key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Environment,
    File,
    Generated,
}

/// Store master key.
pub struct MasterKey([u8; KEY_LENGTH]);

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, StoreError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| StoreError::MasterKey(format!("invalid base64: {}", e)))?;
        let key: [u8; KEY_LENGTH] = bytes.try_into().map_err(|b: Vec<u8>| {
            StoreError::MasterKey(format!("expected {} bytes, got {}", KEY_LENGTH, b.len()))
        })?;
        Ok(Self(key))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Resolve the master key for a store.
    ///
    /// The environment variable wins. Otherwise `master.key` in the store
    /// root is read, or generated with mode 0600 on first use.
    pub fn load_or_create(root: &Path, env_var: &str) -> Result<(Self, KeySource), StoreError> {
        if let Ok(value) = std::env::var(env_var) {
            if !value.trim().is_empty() {
                return Ok((Self::from_base64(&value)?, KeySource::Environment));
            }
        }

        let path = root.join("master.key");
        if path.exists() {
            let encoded = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            return Ok((Self::from_base64(&encoded)?, KeySource::File));
        }

        let key = Self::generate();
        super::write_atomic(&path, key.to_base64().as_bytes(), true)?;
        info!(path = %path.display(), "Generated store master key");
        Ok((key, KeySource::Generated))
    }

    /// Short, non-reversible fingerprint used to detect a wrong master key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"certctl-master-key");
        hasher.update(self.0);
        hex::encode(&hasher.finalize()[..8])
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }

    pub fn seal(&self, plaintext: &[u8], aad: &str) -> Result<SealedKey, StoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| StoreError::MasterKey("encryption failed".to_string()))?;

        Ok(SealedKey {
            version: SEAL_VERSION,
            algorithm: KEY_ENCRYPTION.to_string(),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    pub fn unseal(&self, sealed: &SealedKey, aad: &str) -> Result<Vec<u8>, StoreError> {
        if sealed.version > SEAL_VERSION {
            return Err(StoreError::UnsupportedVersion {
                what: "key envelope",
                found: sealed.version,
                supported: SEAL_VERSION,
            });
        }
        if sealed.algorithm != KEY_ENCRYPTION {
            return Err(StoreError::corrupted(
                aad,
                format!("unknown key encryption '{}'", sealed.algorithm),
            ));
        }

        let nonce = STANDARD
            .decode(&sealed.nonce)
            .map_err(|e| StoreError::corrupted(aad, format!("invalid nonce: {}", e)))?;
        if nonce.len() != NONCE_LENGTH {
            return Err(StoreError::corrupted(aad, "invalid nonce length"));
        }
        let ciphertext = STANDARD
            .decode(&sealed.ciphertext)
            .map_err(|e| StoreError::corrupted(aad, format!("invalid ciphertext: {}", e)))?;

        self.cipher()
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| StoreError::corrupted(aad, "key envelope failed authentication"))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Encrypted key envelope, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedKey {
    pub version: u32,
    pub algorithm: String,
    pub nonce: String,
    pub ciphertext: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seal_unseal() {
        let key = MasterKey::generate();
        let sealed = key.seal(b"secret key material", "key-1").unwrap();
        assert_ne!(sealed.ciphertext, STANDARD.encode(b"secret key material"));
        assert_eq!(key.unseal(&sealed, "key-1").unwrap(), b"secret key material");
    }

    #[test]
    fn test_unseal_rejects_wrong_aad_and_key() {
        let key = MasterKey::generate();
        let sealed = key.seal(b"secret", "key-1").unwrap();
        assert!(key.unseal(&sealed, "key-2").is_err());

        let other = MasterKey::generate();
        assert!(other.unseal(&sealed, "key-1").is_err());
    }

    #[test]
    fn test_unseal_rejects_newer_version() {
        let key = MasterKey::generate();
        let mut sealed = key.seal(b"secret", "k").unwrap();
        sealed.version = SEAL_VERSION + 1;
        assert!(matches!(
            key.unseal(&sealed, "k"),
            Err(StoreError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_base64_roundtrip_and_length_check() {
        let key = MasterKey::generate();
        let restored = MasterKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.fingerprint(), restored.fingerprint());

        assert!(MasterKey::from_base64(&STANDARD.encode([0u8; 16])).is_err());
        assert!(MasterKey::from_base64("***").is_err());
    }

    #[test]
    fn test_load_or_create_persists_key() {
        let dir = TempDir::new().unwrap();
        let env = "CERTCTL_TEST_SEAL_UNSET_KEY";

        let (first, source) = MasterKey::load_or_create(dir.path(), env).unwrap();
        assert_eq!(source, KeySource::Generated);
        let (second, source) = MasterKey::load_or_create(dir.path(), env).unwrap();
        assert_eq!(source, KeySource::File);
        assert_eq!(first.fingerprint(), second.fingerprint());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dir.path().join("master.key"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = MasterKey::generate();
        let debug = format!("{:?}", key);
        assert!(!debug.contains(&key.to_base64()));
    }
}
