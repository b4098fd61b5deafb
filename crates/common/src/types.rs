//! Shared domain types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::CertError;

/// Key algorithm for certificate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

impl KeyAlgorithm {
    pub const ALL: [KeyAlgorithm; 3] = [Self::EcdsaP256, Self::EcdsaP384, Self::Ed25519];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EcdsaP256 => "ecdsa-p256",
            Self::EcdsaP384 => "ecdsa-p384",
            Self::Ed25519 => "ed25519",
        }
    }

    /// Approximate symmetric-equivalent strength in bits.
    pub fn security_bits(&self) -> u32 {
        match self {
            Self::EcdsaP256 | Self::Ed25519 => 128,
            Self::EcdsaP384 => 192,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ecdsa-p256" | "p256" | "ec256" | "es256" => Ok(Self::EcdsaP256),
            "ecdsa-p384" | "p384" | "ec384" | "es384" => Ok(Self::EcdsaP384),
            "ed25519" => Ok(Self::Ed25519),
            other if other.starts_with("rsa") => Err(CertError::UnsupportedAlgorithm {
                algorithm: s.to_string(),
                reason: "RSA keys cannot be generated; use ecdsa-p256, ecdsa-p384 or ed25519"
                    .to_string(),
            }),
            _ => Err(CertError::UnsupportedAlgorithm {
                algorithm: s.to_string(),
                reason: "valid algorithms: ecdsa-p256, ecdsa-p384, ed25519".to_string(),
            }),
        }
    }
}

/// Proof-of-control challenge type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChallengeKind {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http-01" | "http01" | "http" => Ok(Self::Http01),
            "dns-01" | "dns01" | "dns" => Ok(Self::Dns01),
            other => Err(format!(
                "invalid challenge type '{}'. Valid types: http-01, dns-01",
                other
            )),
        }
    }
}

/// When a certificate becomes due for renewal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenewalThreshold {
    /// Renew once this fraction of the total validity is left.
    RemainingFraction(f64),
    /// Renew this long before expiry.
    BeforeExpiry(Duration),
}

impl Default for RenewalThreshold {
    fn default() -> Self {
        Self::RemainingFraction(1.0 / 3.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_algorithm_parse() {
        assert_eq!(
            "ecdsa-p256".parse::<KeyAlgorithm>().unwrap(),
            KeyAlgorithm::EcdsaP256
        );
        assert_eq!("P384".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::EcdsaP384);
        assert_eq!("ed25519".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Ed25519);
    }

    #[test]
    fn test_key_algorithm_rejects_unknown() {
        let err = "rsa-2048".parse::<KeyAlgorithm>().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UnsupportedAlgorithm);

        let err = "dsa".parse::<KeyAlgorithm>().unwrap_err();
        assert!(err.to_string().contains("dsa"));
    }

    #[test]
    fn test_key_algorithm_display_roundtrip() {
        for alg in KeyAlgorithm::ALL {
            assert_eq!(alg.to_string().parse::<KeyAlgorithm>().unwrap(), alg);
        }
    }

    #[test]
    fn test_challenge_kind_parse() {
        assert_eq!("dns-01".parse::<ChallengeKind>().unwrap(), ChallengeKind::Dns01);
        assert_eq!("HTTP-01".parse::<ChallengeKind>().unwrap(), ChallengeKind::Http01);
        assert!("tls-alpn-01".parse::<ChallengeKind>().is_err());
    }
}
