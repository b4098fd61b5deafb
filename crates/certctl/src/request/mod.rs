//! Request builder.
//!
//! Turns a subject, a list of SANs and a key algorithm into a fresh key and
//! a signed CSR. Names and algorithm are checked against policy before any
//! key material is generated.

use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use certctl_common::{CertError, CertResult, Identity, KeyAlgorithm};

use crate::policy::{self, KeyStrength, Policy};

mod domain;
mod key;

pub use domain::{root_domain, wildcard_pair};
pub use key::{KeyId, KeyPair};

/// A certificate signing request ready to be submitted.
///
/// Refers to its key by [`KeyId`]; the key itself is handed to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub identity: Identity,
    pub subject: String,
    /// Ordered SAN set, subject first.
    pub sans: Vec<String>,
    pub key_algorithm: KeyAlgorithm,
    pub key_id: KeyId,
    pub validity_days: u32,
    #[serde(skip)]
    pub csr_der: Vec<u8>,
    pub csr_pem: String,
}

/// Output of [`RequestBuilder::build`].
#[derive(Debug)]
pub struct BuiltRequest {
    pub request: CertificateRequest,
    pub key: KeyPair,
}

/// Builds requests under a policy.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    policy: Arc<Policy>,
    validity_days: u32,
}

impl RequestBuilder {
    pub fn new(policy: Arc<Policy>, validity_days: u32) -> Self {
        Self {
            policy,
            validity_days,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Validate the inputs, generate a key and serialize the CSR.
    pub fn build(
        &self,
        subject: &str,
        sans: &[String],
        key_algorithm: KeyAlgorithm,
    ) -> CertResult<BuiltRequest> {
        let names = policy::validate_request(subject, sans, &self.policy)?;
        policy::validate_key_strength(&KeyStrength::of(key_algorithm), &self.policy)?;

        let subject = names[0].clone();
        let identity = Identity::new(&subject)?;
        let key = KeyPair::generate(key_algorithm)?;

        let mut params = CertificateParams::new(names.clone()).map_err(|e| {
            CertError::InvalidSubject {
                name: subject.clone(),
                reason: e.to_string(),
            }
        })?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(subject.clone()));
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(key.rcgen())
            .map_err(|e| CertError::InternalStore(format!("failed to create CSR: {}", e)))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| CertError::InternalStore(format!("failed to encode CSR: {}", e)))?;

        debug!(
            identity = %identity,
            names = names.len(),
            algorithm = %key_algorithm,
            key_id = key.key_id().short(),
            "Built certificate request"
        );

        Ok(BuiltRequest {
            request: CertificateRequest {
                identity,
                subject,
                sans: names,
                key_algorithm,
                key_id: key.key_id().clone(),
                validity_days: self.validity_days,
                csr_der: csr.der().to_vec(),
                csr_pem,
            },
            key,
        })
    }
}
