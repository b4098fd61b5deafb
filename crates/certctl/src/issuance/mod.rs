//! Issuance engine and certificate authorities.
//!
//! # Architecture
//!
//! - [`Authority`] - order/challenge/finalize protocol of a CA
//! - [`AcmeAuthority`] - ACME v2 through `instant-acme`
//! - [`LocalAuthority`] - private CA for internal PKI
//! - [`ChallengeSolver`] - puts challenge responses in place
//!   ([`ChallengeManager`], [`WebrootSolver`], [`ManualDnsSolver`])
//! - [`IssuanceEngine`] - the state machine tying them to the store

mod acme;
mod authority;
mod challenge;
mod dns;
mod engine;
mod local;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use certctl_common::{CertError, CertResult, ChallengeKind};
use certctl_config::{AuthorityConfig, AuthorityKind};

use crate::store::CertStore;

pub use acme::AcmeAuthority;
pub use authority::{Authority, Challenge, OrderToken, Submission, ValidationStatus};
pub use challenge::{ChallengeManager, ChallengeSolver, WebrootSolver, ACME_CHALLENGE_PREFIX};
pub use dns::{record_name, record_value, ManualDnsSolver, DEFAULT_RESOLVERS};
pub use engine::{EngineSettings, IssuanceEngine, IssuanceKind, IssuanceState, Issued};
pub use local::LocalAuthority;

/// Pick the challenge solver for the configured authority.
///
/// The local authority verifies against the in-process `responder`, so it
/// always gets that solver. For ACME, HTTP-01 without a webroot also answers
/// from the responder.
pub fn solver_from_config(
    config: &AuthorityConfig,
    responder: &ChallengeManager,
) -> Arc<dyn ChallengeSolver> {
    if config.kind == AuthorityKind::Local {
        if config.webroot.is_some() {
            warn!("Ignoring webroot, the local authority answers its own challenges");
        }
        return Arc::new(responder.clone());
    }
    match (config.challenge, &config.webroot) {
        (ChallengeKind::Dns01, _) => Arc::new(ManualDnsSolver::new(
            Duration::from_secs(config.dns_propagation_timeout_secs),
            Duration::from_secs(config.dns_check_interval_secs),
        )),
        (ChallengeKind::Http01, Some(webroot)) => Arc::new(WebrootSolver::new(webroot)),
        (ChallengeKind::Http01, None) => Arc::new(responder.clone()),
    }
}

/// Open the configured authority.
pub async fn authority_from_config(
    config: &AuthorityConfig,
    store: &Arc<CertStore>,
    responder: &ChallengeManager,
) -> CertResult<Arc<dyn Authority>> {
    match config.kind {
        AuthorityKind::Acme => {
            let authority = AcmeAuthority::connect(
                store,
                &config.directory_url,
                config.email.as_deref(),
                config.challenge,
            )
            .await?;
            info!(
                directory = %config.directory_url,
                staging = config.is_staging(),
                challenge = %config.challenge,
                "Using ACME authority"
            );
            Ok(Arc::new(authority))
        }
        AuthorityKind::Local => {
            if config.challenge != ChallengeKind::Http01 {
                return Err(CertError::PolicyViolation(
                    "the local authority only issues http-01 challenges".to_string(),
                ));
            }
            let authority = LocalAuthority::open(
                store,
                &config.local_ca_name,
                config.local_validity_days,
                responder.clone(),
            )?;
            info!(name = %config.local_ca_name, "Using local authority");
            Ok(Arc::new(authority))
        }
    }
}
