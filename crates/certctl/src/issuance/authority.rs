//! Certificate authority abstraction.
//!
//! An authority is driven in explicit steps so the engine can bound each one
//! with a timeout and resume from the [`OrderToken`] after the challenge
//! suspend point.

use std::fmt;

use async_trait::async_trait;
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};

use certctl_common::{CertResult, ChallengeKind};

use crate::request::CertificateRequest;

/// Continuation handle for an order in progress at an authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderToken(String);

impl OrderToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A proof-of-control challenge for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: ChallengeKind,
    /// DNS name being validated.
    pub identifier: String,
    pub token: String,
    pub key_authorization: String,
    /// Authority-side reference used to report readiness.
    pub url: String,
}

/// What `submit` returns: the order continuation and the challenges that
/// must be solved before the order can be finalized.
#[derive(Debug, Clone)]
pub struct Submission {
    pub order: OrderToken,
    pub challenges: Vec<Challenge>,
}

/// Validation state of an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    /// The authority has not decided yet.
    Pending,
    /// All challenges validated; the order can be finalized.
    Ready,
    /// Validation failed for good.
    Invalid(String),
}

/// A certificate authority.
///
/// Implementations report transient trouble as
/// [`certctl_common::CertError::AuthorityUnreachable`] so the engine can retry.
#[async_trait]
pub trait Authority: Send + Sync {
    /// Short name for logs and audit records.
    fn name(&self) -> &str;

    /// Challenge type this authority will hand out.
    fn challenge_kind(&self) -> ChallengeKind;

    /// Create an order for the request's names.
    async fn submit(&self, request: &CertificateRequest) -> CertResult<Submission>;

    /// Tell the authority a challenge is in place.
    async fn notify(&self, order: &OrderToken, challenge: &Challenge) -> CertResult<()>;

    /// Ask for the current validation state.
    async fn poll(&self, order: &OrderToken) -> CertResult<ValidationStatus>;

    /// Submit the CSR and return the issued chain as PEM, leaf first.
    async fn finalize(
        &self,
        order: &OrderToken,
        request: &CertificateRequest,
    ) -> CertResult<String>;

    /// Revoke a previously issued certificate.
    async fn revoke(&self, chain_pem: &str) -> CertResult<()>;

    /// Forget an order. Called once the engine is done with it.
    fn release(&self, _order: &OrderToken) {}

    /// Roots this authority issues under, in addition to public roots.
    fn trust_anchors(&self) -> Vec<CertificateDer<'static>> {
        Vec::new()
    }
}
