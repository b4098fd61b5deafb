//! Certificate key pairs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use certctl_common::{CertError, CertResult, KeyAlgorithm};

use crate::policy::KeyStrength;

/// SHA-256 fingerprint of a public key, lowercase hex.
///
/// Requests and certificates refer to keys by id only; the key material
/// itself stays in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(public_key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(16)]
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A private key tagged with its algorithm.
pub struct KeyPair {
    algorithm: KeyAlgorithm,
    key_id: KeyId,
    inner: rcgen::KeyPair,
}

impl KeyPair {
    /// Generate a fresh key.
    pub fn generate(algorithm: KeyAlgorithm) -> CertResult<Self> {
        let inner = rcgen::KeyPair::generate_for(signature_algorithm(algorithm)).map_err(|e| {
            CertError::UnsupportedAlgorithm {
                algorithm: algorithm.to_string(),
                reason: format!("key generation failed: {}", e),
            }
        })?;
        Ok(Self::wrap(algorithm, inner))
    }

    /// Load a PKCS#8 PEM key.
    pub fn from_pem(pem: &str) -> CertResult<Self> {
        let inner = rcgen::KeyPair::from_pem(pem)
            .map_err(|e| CertError::InternalStore(format!("invalid private key: {}", e)))?;
        let algorithm = KeyAlgorithm::ALL
            .into_iter()
            .find(|alg| inner.algorithm() == signature_algorithm(*alg))
            .ok_or_else(|| CertError::UnsupportedAlgorithm {
                algorithm: format!("{:?}", inner.algorithm()),
                reason: "stored key uses an algorithm certctl does not manage".to_string(),
            })?;
        Ok(Self::wrap(algorithm, inner))
    }

    fn wrap(algorithm: KeyAlgorithm, inner: rcgen::KeyPair) -> Self {
        let key_id = KeyId::from_public_key(inner.public_key_raw());
        Self {
            algorithm,
            key_id,
            inner,
        }
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    pub fn strength(&self) -> KeyStrength {
        KeyStrength::of(self.algorithm)
    }

    /// PKCS#8 PEM of the private key. Only the store should call this.
    pub(crate) fn serialize_pem(&self) -> String {
        self.inner.serialize_pem()
    }

    pub(crate) fn rcgen(&self) -> &rcgen::KeyPair {
        &self.inner
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id.short())
            .finish_non_exhaustive()
    }
}

fn signature_algorithm(algorithm: KeyAlgorithm) -> &'static rcgen::SignatureAlgorithm {
    match algorithm {
        KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        KeyAlgorithm::Ed25519 => &rcgen::PKCS_ED25519,
    }
}
