//! ACME v2 authority.
//!
//! Wraps `instant-acme`. Account credentials are sealed into the store under
//! a name derived from the directory URL, so staging and production accounts
//! never mix.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus, RevocationRequest,
};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use certctl_common::{CertError, CertResult, ChallengeKind};

use super::authority::{Authority, Challenge, OrderToken, Submission, ValidationStatus};
use crate::certinfo::parse_chain;
use crate::request::CertificateRequest;
use crate::store::CertStore;

/// Attempts to download the certificate after finalization.
const CERTIFICATE_POLLS: u32 = 10;
const CERTIFICATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// ACME problem types caused by the client's validation setup.
const VALIDATION_PROBLEMS: &[&str] = &[
    "unauthorized",
    "incorrectResponse",
    "dns",
    "connection",
    "caa",
    "tls",
];

/// An ACME certificate authority.
pub struct AcmeAuthority {
    account: Account,
    directory_url: String,
    challenge_kind: ChallengeKind,
    orders: DashMap<OrderToken, Arc<Mutex<Order>>>,
}

impl AcmeAuthority {
    /// Load the account for `directory_url` from the store, registering a
    /// new one if none exists.
    pub async fn connect(
        store: &CertStore,
        directory_url: &str,
        email: Option<&str>,
        challenge_kind: ChallengeKind,
    ) -> CertResult<Self> {
        let secret = account_secret_name(directory_url);

        let account = match store.read_secret(&secret)? {
            Some(bytes) => {
                let credentials: AccountCredentials = serde_json::from_slice(&bytes)
                    .map_err(|e| CertError::integrity("acme-account", e.to_string()))?;
                let account = Account::from_credentials(credentials)
                    .await
                    .map_err(map_acme_error)?;
                debug!(directory = %directory_url, "Loaded ACME account");
                account
            }
            None => {
                let contact: Vec<String> = email.iter().map(|e| format!("mailto:{}", e)).collect();
                let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();

                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &contact_refs,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    None,
                )
                .await
                .map_err(map_acme_error)?;

                let json = serde_json::to_vec(&credentials).map_err(|e| {
                    CertError::InternalStore(format!("failed to encode ACME credentials: {}", e))
                })?;
                store.write_secret(&secret, &json)?;
                info!(directory = %directory_url, contact = ?email, "Registered ACME account");
                account
            }
        };

        Ok(Self {
            account,
            directory_url: directory_url.to_string(),
            challenge_kind,
            orders: DashMap::new(),
        })
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    fn order(&self, token: &OrderToken) -> CertResult<Arc<Mutex<Order>>> {
        self.orders
            .get(token)
            .map(|o| Arc::clone(&o))
            .ok_or_else(|| CertError::InternalStore(format!("unknown order {}", token)))
    }

    fn wanted_type(&self) -> ChallengeType {
        match self.challenge_kind {
            ChallengeKind::Http01 => ChallengeType::Http01,
            ChallengeKind::Dns01 => ChallengeType::Dns01,
        }
    }
}

impl std::fmt::Debug for AcmeAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeAuthority")
            .field("directory_url", &self.directory_url)
            .field("challenge_kind", &self.challenge_kind)
            .field("pending_orders", &self.orders.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authority for AcmeAuthority {
    fn name(&self) -> &str {
        "acme"
    }

    fn challenge_kind(&self) -> ChallengeKind {
        self.challenge_kind
    }

    async fn submit(&self, request: &CertificateRequest) -> CertResult<Submission> {
        let identifiers: Vec<Identifier> = request
            .sans
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect();

        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(map_acme_error)?;

        let authorizations = order.authorizations().await.map_err(map_acme_error)?;
        let wanted = self.wanted_type();

        let mut challenges = Vec::new();
        for authz in &authorizations {
            let Identifier::Dns(name) = &authz.identifier;
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(CertError::challenge_failed(
                        name.as_str(),
                        format!("authorization is {:?}", status),
                    ))
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == wanted)
                .ok_or_else(|| {
                    CertError::challenge_failed(
                        name.as_str(),
                        format!("authority offered no {} challenge", self.challenge_kind),
                    )
                })?;

            challenges.push(Challenge {
                kind: self.challenge_kind,
                identifier: name.clone(),
                token: challenge.token.clone(),
                key_authorization: order.key_authorization(challenge).as_str().to_string(),
                url: challenge.url.clone(),
            });
        }

        let token = OrderToken::new(Uuid::new_v4().to_string());
        self.orders
            .insert(token.clone(), Arc::new(Mutex::new(order)));
        debug!(
            identity = %request.identity,
            order = %token,
            challenges = challenges.len(),
            "Created ACME order"
        );

        Ok(Submission {
            order: token,
            challenges,
        })
    }

    async fn notify(&self, token: &OrderToken, challenge: &Challenge) -> CertResult<()> {
        let order = self.order(token)?;
        let mut order = order.lock().await;
        order
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(map_acme_error)
    }

    async fn poll(&self, token: &OrderToken) -> CertResult<ValidationStatus> {
        let order = self.order(token)?;
        let mut order = order.lock().await;
        let state = order.refresh().await.map_err(map_acme_error)?;

        Ok(match state.status {
            OrderStatus::Pending => ValidationStatus::Pending,
            OrderStatus::Ready | OrderStatus::Processing | OrderStatus::Valid => {
                ValidationStatus::Ready
            }
            OrderStatus::Invalid => ValidationStatus::Invalid(
                state
                    .error
                    .as_ref()
                    .and_then(|p| p.detail.clone())
                    .unwrap_or_else(|| "order is invalid".to_string()),
            ),
        })
    }

    async fn finalize(
        &self,
        token: &OrderToken,
        request: &CertificateRequest,
    ) -> CertResult<String> {
        let order = self.order(token)?;
        let mut order = order.lock().await;

        if order.state().status == OrderStatus::Ready {
            order
                .finalize(&request.csr_der)
                .await
                .map_err(map_acme_error)?;
        }

        for attempt in 1..=CERTIFICATE_POLLS {
            if let Some(chain) = order.certificate().await.map_err(map_acme_error)? {
                info!(identity = %request.identity, "ACME order finalized");
                return Ok(chain);
            }
            debug!(attempt, "Certificate not available yet");
            tokio::time::sleep(CERTIFICATE_POLL_INTERVAL).await;
        }

        Err(CertError::Timeout {
            operation: "certificate download".to_string(),
            elapsed: CERTIFICATE_POLL_INTERVAL * CERTIFICATE_POLLS,
        })
    }

    async fn revoke(&self, chain_pem: &str) -> CertResult<()> {
        let chain = parse_chain(chain_pem).map_err(CertError::PolicyViolation)?;
        self.account
            .revoke(&RevocationRequest {
                certificate: &chain[0],
                reason: None,
            })
            .await
            .map_err(map_acme_error)?;
        info!(directory = %self.directory_url, "Revoked certificate at ACME authority");
        Ok(())
    }

    fn release(&self, token: &OrderToken) {
        if self.orders.remove(token).is_none() {
            warn!(order = %token, "Released unknown ACME order");
        }
    }
}

/// Store secret name for the account at a directory.
fn account_secret_name(directory_url: &str) -> String {
    let digest = Sha256::digest(directory_url.as_bytes());
    format!("acme-account-{}", hex::encode(&digest[..8]))
}

/// Translate ACME errors into the certctl taxonomy.
///
/// Server-side and rate-limit problems are transient; validation problems
/// are challenge failures; anything else the server rejects is final.
fn map_acme_error(e: instant_acme::Error) -> CertError {
    match e {
        instant_acme::Error::Api(problem) => {
            let kind = problem
                .r#type
                .as_deref()
                .and_then(|t| t.rsplit(':').next())
                .unwrap_or("")
                .to_string();
            let detail = problem
                .detail
                .clone()
                .unwrap_or_else(|| "no detail".to_string());
            let status = problem.status.unwrap_or(0);

            if status >= 500 || kind == "rateLimited" || kind == "badNonce" {
                CertError::AuthorityUnreachable(format!("{} ({})", detail, kind))
            } else if VALIDATION_PROBLEMS.contains(&kind.as_str()) {
                CertError::challenge_failed("order", detail)
            } else {
                CertError::PolicyViolation(format!("authority rejected the request: {}", detail))
            }
        }
        other => CertError::AuthorityUnreachable(other.to_string()),
    }
}
