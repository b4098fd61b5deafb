//! X.509 certificate parsing helpers.

use chrono::{DateTime, Duration, Utc};
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use x509_parser::extensions::GeneralName;
use x509_parser::oid_registry::OID_SIG_ED25519;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::policy::KeyStrength;
use crate::request::KeyId;
use certctl_common::KeyAlgorithm;

/// Parse a PEM bundle into DER certificates, preserving order.
pub fn parse_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    let mut reader = pem.as_bytes();
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid PEM: {}", e))?;
    if chain.is_empty() {
        return Err("no certificates in PEM bundle".to_string());
    }
    Ok(chain)
}

/// Encode one DER certificate as PEM.
pub fn to_pem(der: &[u8]) -> String {
    use base64::Engine;

    let body = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = String::with_capacity(body.len() + body.len() / 64 + 60);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Summary of a parsed certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertInfo {
    /// Serial number, lowercase hex.
    pub serial: String,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// DNS subject alternative names, lowercase, in certificate order.
    pub sans: Vec<String>,
    /// Fingerprint of the certified public key.
    pub key_id: KeyId,
    pub key_strength: KeyStrength,
    pub is_ca: bool,
}

impl CertInfo {
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, cert) =
            parse_x509_certificate(der).map_err(|e| format!("invalid certificate: {}", e))?;
        Self::from_x509(&cert)
    }

    pub fn from_x509(cert: &X509Certificate<'_>) -> Result<Self, String> {
        let not_before = timestamp(cert.validity().not_before.timestamp())?;
        let not_after = timestamp(cert.validity().not_after.timestamp())?;

        let mut sans = Vec::new();
        if let Ok(Some(ext)) = cert.subject_alternative_name() {
            for name in &ext.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    sans.push(dns.to_ascii_lowercase());
                }
            }
        }

        let spki = cert.public_key();
        Ok(Self {
            serial: hex::encode(cert.raw_serial()),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            not_before,
            not_after,
            sans,
            key_id: KeyId::from_public_key(&spki.subject_public_key.data),
            key_strength: key_strength(spki),
            is_ca: cert.is_ca(),
        })
    }

    /// Total validity period.
    pub fn lifetime(&self) -> Duration {
        self.not_after - self.not_before
    }

    /// Time left until expiry. Negative once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.not_after - now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| format!("timestamp out of range: {}", secs))
}

fn key_strength(spki: &SubjectPublicKeyInfo<'_>) -> KeyStrength {
    if spki.algorithm.algorithm == OID_SIG_ED25519 {
        return KeyStrength::of(KeyAlgorithm::Ed25519);
    }
    match spki.parsed() {
        Ok(PublicKey::EC(point)) => match point.key_size() {
            256 => KeyStrength::of(KeyAlgorithm::EcdsaP256),
            384 => KeyStrength::of(KeyAlgorithm::EcdsaP384),
            bits => KeyStrength::unknown(format!("ecdsa-{}", bits), (bits / 2) as u32),
        },
        Ok(PublicKey::RSA(rsa)) => KeyStrength::rsa(rsa.key_size()),
        _ => KeyStrength::unknown(spki.algorithm.algorithm.to_id_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(names: &[&str], alg: &'static rcgen::SignatureAlgorithm) -> (String, Vec<u8>) {
        let key = rcgen::KeyPair::generate_for(alg).unwrap();
        let params =
            rcgen::CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.public_key_raw().to_vec())
    }

    #[test]
    fn test_parse_chain_rejects_empty() {
        assert!(parse_chain("").is_err());
        assert!(parse_chain("garbage").is_err());
    }

    #[test]
    fn test_cert_info_fields() {
        let (pem, public_key) =
            self_signed(&["Example.com", "www.example.com"], &rcgen::PKCS_ECDSA_P256_SHA256);
        let chain = parse_chain(&pem).unwrap();
        assert_eq!(chain.len(), 1);

        let info = CertInfo::from_der(&chain[0]).unwrap();
        assert_eq!(info.sans, vec!["example.com", "www.example.com"]);
        assert_eq!(info.key_id, KeyId::from_public_key(&public_key));
        assert_eq!(info.key_strength.algorithm, Some(KeyAlgorithm::EcdsaP256));
        assert!(!info.is_ca);
        assert!(info.not_after > info.not_before);
    }

    #[test]
    fn test_ed25519_and_p384_strength() {
        let (pem, _) = self_signed(&["a.example.com"], &rcgen::PKCS_ED25519);
        let info = CertInfo::from_der(&parse_chain(&pem).unwrap()[0]).unwrap();
        assert_eq!(info.key_strength.algorithm, Some(KeyAlgorithm::Ed25519));

        let (pem, _) = self_signed(&["b.example.com"], &rcgen::PKCS_ECDSA_P384_SHA384);
        let info = CertInfo::from_der(&parse_chain(&pem).unwrap()[0]).unwrap();
        assert_eq!(info.key_strength.security_bits, 192);
    }
}
