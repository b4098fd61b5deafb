//! Validation and policy layer.
//!
//! Pure checks applied before a request is built and after a chain is
//! issued. Every check fails closed: anything that cannot be parsed or
//! proven is rejected.

use chrono::{DateTime, Utc};
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use x509_parser::prelude::*;

use certctl_common::{CertError, CertResult, KeyAlgorithm};
use certctl_config::PolicyConfig;

use crate::certinfo::CertInfo;
use crate::request::CertificateRequest;

mod names;
mod trust;

pub use names::{normalize_name, validate_dns_name};
pub use trust::TrustStore;

/// Minimum strength accepted for intermediate certificates.
const MIN_INTERMEDIATE_BITS: u32 = 112;

/// Issuance policy.
#[derive(Debug, Clone)]
pub struct Policy {
    pub allowed_algorithms: Vec<KeyAlgorithm>,
    pub min_security_bits: u32,
    pub allow_wildcards: bool,
    pub max_sans: usize,
    /// Lowercase suffixes without a leading dot.
    pub denied_suffixes: Vec<String>,
    pub max_validity_days: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

impl From<&PolicyConfig> for Policy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            allowed_algorithms: config.allowed_algorithms.clone(),
            min_security_bits: config.min_security_bits,
            allow_wildcards: config.allow_wildcards,
            max_sans: config.max_sans,
            denied_suffixes: config
                .denied_suffixes
                .iter()
                .map(|s| s.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_validity_days: config.max_validity_days,
        }
    }
}

/// Strength of a public key, as generated or as found in a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStrength {
    /// Set when the key is of an algorithm certctl can generate.
    pub algorithm: Option<KeyAlgorithm>,
    pub label: String,
    pub security_bits: u32,
}

impl KeyStrength {
    pub fn of(algorithm: KeyAlgorithm) -> Self {
        Self {
            algorithm: Some(algorithm),
            label: algorithm.as_str().to_string(),
            security_bits: algorithm.security_bits(),
        }
    }

    /// RSA strength per NIST SP 800-57.
    pub fn rsa(modulus_bits: usize) -> Self {
        let security_bits = match modulus_bits {
            0..=1023 => 0,
            1024..=2047 => 80,
            2048..=3071 => 112,
            3072..=7679 => 128,
            7680..=15359 => 192,
            _ => 256,
        };
        Self {
            algorithm: None,
            label: format!("rsa-{}", modulus_bits),
            security_bits,
        }
    }

    pub fn unknown(label: impl Into<String>, security_bits: u32) -> Self {
        Self {
            algorithm: None,
            label: label.into(),
            security_bits,
        }
    }
}

/// Validate and normalize the names of a request.
///
/// Returns the ordered SAN set: the subject first, then the remaining
/// names in the order given, without duplicates.
pub fn validate_request(subject: &str, sans: &[String], policy: &Policy) -> CertResult<Vec<String>> {
    let subject = normalize_name(subject);
    validate_dns_name(&subject).map_err(|reason| CertError::InvalidSubject {
        name: subject.clone(),
        reason,
    })?;

    let mut names = vec![subject.clone()];
    for san in sans {
        let san = normalize_name(san);
        validate_dns_name(&san).map_err(|reason| CertError::InvalidSubject {
            name: san.clone(),
            reason,
        })?;
        if !names.contains(&san) {
            names.push(san);
        }
    }

    if names.len() > policy.max_sans {
        return Err(CertError::PolicyViolation(format!(
            "{} names requested, policy allows at most {}",
            names.len(),
            policy.max_sans
        )));
    }

    for name in &names {
        if !policy.allow_wildcards && name.starts_with("*.") {
            return Err(CertError::PolicyViolation(format!(
                "wildcard name '{}' is not allowed by policy",
                name
            )));
        }

        let bare = name.trim_start_matches("*.");
        if let Some(suffix) = policy
            .denied_suffixes
            .iter()
            .find(|suffix| bare == suffix.as_str() || bare.ends_with(&format!(".{}", suffix)))
        {
            return Err(CertError::PolicyViolation(format!(
                "name '{}' falls under denied suffix '{}'",
                name, suffix
            )));
        }
    }

    Ok(names)
}

/// Check a key against the algorithm allow-list and the strength floor.
pub fn validate_key_strength(strength: &KeyStrength, policy: &Policy) -> CertResult<()> {
    match strength.algorithm {
        Some(alg) if !policy.allowed_algorithms.contains(&alg) => {
            return Err(CertError::PolicyViolation(format!(
                "key algorithm {} is not allowed by policy",
                alg
            )));
        }
        None => {
            return Err(CertError::UnsupportedAlgorithm {
                algorithm: strength.label.clone(),
                reason: "not an accepted certificate key algorithm".to_string(),
            });
        }
        Some(_) => {}
    }

    if strength.security_bits < policy.min_security_bits {
        return Err(CertError::PolicyViolation(format!(
            "{} provides {} bits of security, policy requires {}",
            strength.label, strength.security_bits, policy.min_security_bits
        )));
    }

    Ok(())
}

/// Structural chain check: every certificate parses, is issued by the next
/// one and carries a valid signature from it.
///
/// Does not look at validity periods or trust anchors.
pub fn verify_chain_structure(chain: &[CertificateDer<'_>]) -> Result<(), String> {
    let parsed = parse_all(chain)?;
    verify_linkage(&parsed)
}

/// Full chain validation against a trust store at `now`.
pub fn validate_chain(
    chain: &[CertificateDer<'_>],
    trust: &TrustStore,
    now: DateTime<Utc>,
) -> CertResult<()> {
    let parsed = parse_all(chain).map_err(CertError::PolicyViolation)?;

    let leaf = &parsed[0];
    if leaf.is_ca() {
        return Err(CertError::PolicyViolation(
            "leaf certificate is a CA certificate".to_string(),
        ));
    }

    let now_ts = now.timestamp();
    for (position, cert) in parsed.iter().enumerate() {
        let validity = cert.validity();
        if now_ts < validity.not_before.timestamp() || now_ts > validity.not_after.timestamp() {
            return Err(CertError::PolicyViolation(format!(
                "certificate {} ({}) is outside its validity period ({} - {})",
                position,
                cert.subject(),
                validity.not_before,
                validity.not_after
            )));
        }
    }

    verify_linkage(&parsed).map_err(CertError::PolicyViolation)?;

    for cert in parsed.iter().skip(1) {
        let info = CertInfo::from_x509(cert).map_err(CertError::PolicyViolation)?;
        if info.key_strength.security_bits < MIN_INTERMEDIATE_BITS {
            return Err(CertError::PolicyViolation(format!(
                "issuer {} uses a weak key ({})",
                cert.subject(),
                info.key_strength.label
            )));
        }
    }

    let last = &parsed[parsed.len() - 1];
    if !trust.is_anchor(last) && !trust.is_signed_by_anchor(last) {
        return Err(CertError::PolicyViolation(format!(
            "chain does not lead to a trusted root (last issuer: {})",
            last.issuer()
        )));
    }

    Ok(())
}

/// Check that an issued chain matches what was requested.
pub fn validate_issued(
    chain: &[CertificateDer<'_>],
    request: &CertificateRequest,
    policy: &Policy,
) -> CertResult<CertInfo> {
    let leaf_der = chain
        .first()
        .ok_or_else(|| CertError::PolicyViolation("empty certificate chain".to_string()))?;
    let leaf = CertInfo::from_der(leaf_der).map_err(CertError::PolicyViolation)?;

    let requested: BTreeSet<&str> = request.sans.iter().map(String::as_str).collect();
    let issued: BTreeSet<&str> = leaf.sans.iter().map(String::as_str).collect();

    let missing: Vec<&str> = requested.difference(&issued).copied().collect();
    if !missing.is_empty() {
        return Err(CertError::PolicyViolation(format!(
            "issued certificate is missing requested names: {}",
            missing.join(", ")
        )));
    }
    let extra: Vec<&str> = issued.difference(&requested).copied().collect();
    if !extra.is_empty() {
        return Err(CertError::PolicyViolation(format!(
            "issued certificate covers names that were not requested: {}",
            extra.join(", ")
        )));
    }

    if leaf.key_id != request.key_id {
        return Err(CertError::PolicyViolation(
            "issued certificate does not carry the requested public key".to_string(),
        ));
    }

    validate_key_strength(&leaf.key_strength, policy)?;

    let max_lifetime = chrono::Duration::days(i64::from(policy.max_validity_days));
    if leaf.lifetime() > max_lifetime {
        return Err(CertError::PolicyViolation(format!(
            "issued certificate is valid for {} days, policy allows at most {}",
            leaf.lifetime().num_days(),
            policy.max_validity_days
        )));
    }

    Ok(leaf)
}

fn parse_all<'a>(chain: &'a [CertificateDer<'_>]) -> Result<Vec<X509Certificate<'a>>, String> {
    if chain.is_empty() {
        return Err("empty certificate chain".to_string());
    }
    chain
        .iter()
        .enumerate()
        .map(|(position, der)| {
            parse_x509_certificate(der)
                .map(|(_, cert)| cert)
                .map_err(|e| format!("certificate {} does not parse: {}", position, e))
        })
        .collect()
}

fn verify_linkage(parsed: &[X509Certificate<'_>]) -> Result<(), String> {
    for (position, pair) in parsed.windows(2).enumerate() {
        let (child, parent) = (&pair[0], &pair[1]);
        if child.issuer().as_raw() != parent.subject().as_raw() {
            return Err(format!(
                "certificate {} is issued by '{}' but is followed by '{}'",
                position,
                child.issuer(),
                parent.subject()
            ));
        }
        if !parent.is_ca() {
            return Err(format!(
                "certificate {} ({}) is not a CA",
                position + 1,
                parent.subject()
            ));
        }
        child
            .verify_signature(Some(parent.public_key()))
            .map_err(|e| format!("certificate {} has an invalid signature: {}", position, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestCa;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_request_orders_subject_first() {
        let policy = Policy::default();
        let result = validate_request(
            "Example.COM",
            &names(&["www.example.com", "example.com", "www.example.com"]),
            &policy,
        )
        .unwrap();
        assert_eq!(result, names(&["example.com", "www.example.com"]));
    }

    #[test]
    fn test_validate_request_invalid_subject() {
        let err = validate_request("exa mple.com", &[], &Policy::default()).unwrap_err();
        assert_eq!(err.kind(), certctl_common::ErrorKind::InvalidSubject);

        let err = validate_request("example.com", &names(&["-bad.example.com"]), &Policy::default())
            .unwrap_err();
        assert_eq!(err.kind(), certctl_common::ErrorKind::InvalidSubject);
    }

    #[test]
    fn test_validate_request_policy_limits() {
        let mut policy = Policy::default();
        policy.allow_wildcards = false;
        let err = validate_request("*.example.com", &[], &policy).unwrap_err();
        assert_eq!(err.kind(), certctl_common::ErrorKind::PolicyViolation);

        let mut policy = Policy::default();
        policy.max_sans = 2;
        let err = validate_request("a.example.com", &names(&["b.example.com", "c.example.com"]), &policy)
            .unwrap_err();
        assert!(err.to_string().contains("at most 2"));

        let mut policy = Policy::default();
        policy.denied_suffixes = vec!["internal".to_string()];
        assert!(validate_request("db.internal", &[], &policy).is_err());
        assert!(validate_request("internal.example.com", &[], &policy).is_ok());
    }

    #[test]
    fn test_validate_key_strength() {
        let policy = Policy::default();
        assert!(validate_key_strength(&KeyStrength::of(KeyAlgorithm::EcdsaP256), &policy).is_ok());

        let err = validate_key_strength(&KeyStrength::rsa(2048), &policy).unwrap_err();
        assert_eq!(err.kind(), certctl_common::ErrorKind::UnsupportedAlgorithm);

        let mut strict = Policy::default();
        strict.min_security_bits = 192;
        let err = validate_key_strength(&KeyStrength::of(KeyAlgorithm::Ed25519), &strict).unwrap_err();
        assert_eq!(err.kind(), certctl_common::ErrorKind::PolicyViolation);

        let mut narrow = Policy::default();
        narrow.allowed_algorithms = vec![KeyAlgorithm::EcdsaP384];
        assert!(validate_key_strength(&KeyStrength::of(KeyAlgorithm::EcdsaP256), &narrow).is_err());
    }

    #[test]
    fn test_validate_chain_against_anchor() {
        let ca = TestCa::new("Test Root");
        let (chain, _) = ca.issue(&["example.com"], 30);

        let mut trust = TrustStore::empty();
        assert!(validate_chain(&chain, &trust, Utc::now()).is_err());

        trust.add_der(&ca.root_der()).unwrap();
        validate_chain(&chain, &trust, Utc::now()).unwrap();
        verify_chain_structure(&chain).unwrap();
    }

    #[test]
    fn test_validate_chain_rejects_expired_and_reordered() {
        let ca = TestCa::new("Test Root");
        let (chain, _) = ca.issue(&["example.com"], 30);
        let mut trust = TrustStore::empty();
        trust.add_der(&ca.root_der()).unwrap();

        let later = Utc::now() + chrono::Duration::days(31);
        assert!(validate_chain(&chain, &trust, later).is_err());

        let reversed: Vec<_> = chain.iter().rev().cloned().collect();
        assert!(validate_chain(&reversed, &trust, Utc::now()).is_err());
        assert!(verify_chain_structure(&reversed).is_err());
        assert!(validate_chain(&[], &trust, Utc::now()).is_err());
    }

    #[test]
    fn test_validate_chain_rejects_foreign_root() {
        let ca = TestCa::new("Test Root");
        let other = TestCa::new("Other Root");
        let (chain, _) = ca.issue(&["example.com"], 30);

        let mut trust = TrustStore::empty();
        trust.add_der(&other.root_der()).unwrap();
        let err = validate_chain(&chain, &trust, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("trusted root"));
    }
}
