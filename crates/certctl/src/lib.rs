//! certctl library
//!
//! Certificate lifecycle management: issue X.509 certificates from an
//! authority through a challenge/response protocol, keep keys and chains
//! encrypted at rest, renew them before expiry and revoke them on demand.
//!
//! - **Store**: versioned, encrypted key and certificate store
//! - **Request Builder**: validated names, fresh keys, CSRs
//! - **Issuance**: ACME and private-CA authorities behind one state machine
//! - **Renewal**: threshold scan and bounded parallel renewal
//! - **Policy**: name, key strength and chain checks
//!
//! # Example
//!
//! ```ignore
//! use certctl::{CertManager, IssueRequest};
//! use certctl_common::KeyAlgorithm;
//! use tokio_util::sync::CancellationToken;
//!
//! let manager = CertManager::from_config(certctl_config::Config::load(None)?).await?;
//! let outcome = manager
//!     .issue(
//!         IssueRequest {
//!             subject: "example.com".into(),
//!             sans: vec!["www.example.com".into()],
//!             key_algorithm: KeyAlgorithm::EcdsaP256,
//!             force: false,
//!         },
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod app;
pub mod audit;
pub mod certinfo;
pub mod cli;
pub mod issuance;
pub mod policy;
pub mod renewal;
pub mod request;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Application context
pub use app::{
    CertManager, CertificateView, IssueOutcome, IssuePlan, IssueRequest, PlannedAction,
    RevokeOutcome,
};

// Audit trail
pub use audit::{AuditEvent, AuditLog, AuditRecord};

// Certificates
pub use certinfo::CertInfo;

// Issuance
pub use issuance::{
    AcmeAuthority, Authority, ChallengeManager, ChallengeSolver, IssuanceEngine, IssuanceState,
    LocalAuthority,
};

// Renewal
pub use renewal::{Claim, RenewalReport, RenewalScheduler, RenewalTask, TaskRegistry, TaskState};

// Requests and policy
pub use policy::{Policy, TrustStore};
pub use request::{CertificateRequest, KeyPair, RequestBuilder};

// Store
pub use store::{CertStatus, CertStore, ExportedFiles, MasterKey, StoredCertificate};
