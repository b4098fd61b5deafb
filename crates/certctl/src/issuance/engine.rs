//! Issuance state machine.
//!
//! ```text
//! draft -> challenge-pending -> challenge-verifying -> issued
//!    \            \                     \
//!     +------------+---------------------+---> rejected
//! ```
//!
//! Each authority call runs under its own timeout. Transient failures are
//! retried through a bounded [`Backoff`]; every retry and every terminal
//! transition is written to the audit log.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use certctl_common::{
    Backoff, BackoffStep, CertError, CertResult, Identity, OperationId, RetryPolicy,
};
use certctl_config::IssuanceConfig;

use super::authority::{Authority, Challenge, OrderToken, ValidationStatus};
use super::challenge::ChallengeSolver;
use crate::audit::{AuditEvent, AuditLog, AuditRecord};
use crate::certinfo::parse_chain;
use crate::policy::{self, Policy, TrustStore};
use crate::request::BuiltRequest;
use crate::request::CertificateRequest;
use crate::store::{CertStore, Handle, IssuedCertificate, Material};

/// Timing and retry limits for one issuance.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub step_timeout: Duration,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl From<&IssuanceConfig> for EngineSettings {
    fn from(config: &IssuanceConfig) -> Self {
        Self {
            step_timeout: config.step_timeout(),
            retry: config.retry_policy(),
            poll_interval: config.poll_interval(),
            max_polls: config.max_polls.max(1),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&IssuanceConfig::default())
    }
}

/// Issuance states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    Draft,
    ChallengePending,
    ChallengeVerifying { polls: u32 },
    Issued,
    Rejected,
}

impl fmt::Display for IssuanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => f.write_str("draft"),
            Self::ChallengePending => f.write_str("challenge-pending"),
            Self::ChallengeVerifying { polls } => write!(f, "challenge-verifying({})", polls),
            Self::Issued => f.write_str("issued"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// Whether a run creates the first certificate for an identity or replaces one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceKind {
    Issue,
    Renew,
}

impl IssuanceKind {
    fn audit_event(self) -> AuditEvent {
        match self {
            Self::Issue => AuditEvent::Issued,
            Self::Renew => AuditEvent::Renewed,
        }
    }
}

/// A committed issuance.
#[derive(Debug, Clone)]
pub struct Issued {
    pub handle: Handle,
    pub certificate: IssuedCertificate,
    pub operation: OperationId,
    pub state: IssuanceState,
}

/// Mutable bookkeeping of one run; cleaned up whatever the outcome.
struct Run {
    identity: Identity,
    operation: OperationId,
    state: IssuanceState,
    order: Option<OrderToken>,
    presented: Vec<Challenge>,
}

impl Run {
    fn transition(&mut self, next: IssuanceState) {
        debug!(
            identity = %self.identity,
            operation = %self.operation,
            from = %self.state,
            to = %next,
            "Issuance state change"
        );
        self.state = next;
    }
}

/// Drives an [`Authority`] from request to committed certificate.
pub struct IssuanceEngine {
    authority: Arc<dyn Authority>,
    solver: Arc<dyn ChallengeSolver>,
    store: Arc<CertStore>,
    audit: Arc<AuditLog>,
    policy: Arc<Policy>,
    trust: Arc<TrustStore>,
    settings: EngineSettings,
}

impl IssuanceEngine {
    pub fn new(
        authority: Arc<dyn Authority>,
        solver: Arc<dyn ChallengeSolver>,
        store: Arc<CertStore>,
        audit: Arc<AuditLog>,
        policy: Arc<Policy>,
        trust: Arc<TrustStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            authority,
            solver,
            store,
            audit,
            policy,
            trust,
            settings,
        }
    }

    pub fn authority(&self) -> &dyn Authority {
        self.authority.as_ref()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Run a built request to completion.
    ///
    /// The key is staged before the order is created; on any failure the
    /// staged key is discarded and a `rejected` record is written.
    pub async fn issue(
        &self,
        built: BuiltRequest,
        kind: IssuanceKind,
        cancel: &CancellationToken,
    ) -> CertResult<Issued> {
        let BuiltRequest { request, key } = built;
        let mut run = Run {
            identity: request.identity.clone(),
            operation: OperationId::new(),
            state: IssuanceState::Draft,
            order: None,
            presented: Vec::new(),
        };

        info!(
            identity = %run.identity,
            operation = %run.operation,
            authority = self.authority.name(),
            names = request.sans.len(),
            kind = ?kind,
            "Starting issuance"
        );

        let result = match self.store.put(&run.identity, Material::Key(key)) {
            Ok(_) => self.drive(&request, cancel, &mut run).await,
            Err(e) => Err(e),
        };
        self.cleanup(&mut run).await;

        let committed = result.and_then(|certificate| {
            let handle = self
                .store
                .put(&run.identity, Material::Certificate(certificate.clone()))?;
            Ok((handle, certificate))
        });

        match committed {
            Ok((handle, certificate)) => {
                run.transition(IssuanceState::Issued);
                self.audit.record_or_warn(
                    &AuditRecord::new(&run.identity, kind.audit_event(), &run.operation)
                        .with_detail(format!(
                            "serial {} valid until {}",
                            certificate.leaf.serial, certificate.leaf.not_after
                        )),
                );
                info!(
                    identity = %run.identity,
                    operation = %run.operation,
                    serial = %certificate.leaf.serial,
                    not_after = %certificate.leaf.not_after,
                    "Certificate issued"
                );
                Ok(Issued {
                    handle,
                    certificate,
                    operation: run.operation,
                    state: run.state,
                })
            }
            Err(error) => {
                run.transition(IssuanceState::Rejected);
                if let Err(e) = self.store.discard_staged(&run.identity) {
                    warn!(identity = %run.identity, error = %e, "Failed to discard staged key");
                }
                self.audit.record_or_warn(
                    &AuditRecord::new(&run.identity, AuditEvent::Rejected, &run.operation)
                        .with_error(&error),
                );
                warn!(
                    identity = %run.identity,
                    operation = %run.operation,
                    kind = %error.kind(),
                    error = %error,
                    "Issuance rejected"
                );
                Err(error)
            }
        }
    }

    async fn drive(
        &self,
        request: &CertificateRequest,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> CertResult<IssuedCertificate> {
        let submission = self
            .call("submit", run, cancel, || self.authority.submit(request))
            .await?;
        let order = submission.order.clone();
        run.order = Some(order.clone());
        run.transition(IssuanceState::ChallengePending);

        for challenge in &submission.challenges {
            if challenge.kind != self.solver.kind() {
                return Err(CertError::challenge_failed(
                    &challenge.identifier,
                    format!(
                        "authority asked for {} but the solver handles {}",
                        challenge.kind,
                        self.solver.kind()
                    ),
                ));
            }
            cancellable(cancel, self.solver.present(challenge)).await?;
            run.presented.push(challenge.clone());
            self.call("notify", run, cancel, || {
                self.authority.notify(&order, challenge)
            })
            .await?;
        }

        let mut polls = 0;
        run.transition(IssuanceState::ChallengeVerifying { polls });
        loop {
            polls += 1;
            let status = self
                .call("poll", run, cancel, || self.authority.poll(&order))
                .await?;
            run.state = IssuanceState::ChallengeVerifying { polls };

            match status {
                ValidationStatus::Ready => break,
                ValidationStatus::Invalid(reason) => {
                    return Err(CertError::challenge_failed(run.identity.as_str(), reason))
                }
                ValidationStatus::Pending if polls >= self.settings.max_polls => {
                    return Err(CertError::Timeout {
                        operation: "challenge validation".to_string(),
                        elapsed: self.settings.poll_interval * polls,
                    })
                }
                ValidationStatus::Pending => {
                    pause(cancel, self.settings.poll_interval).await?;
                }
            }
        }

        let chain_pem = self
            .call("finalize", run, cancel, || {
                self.authority.finalize(&order, request)
            })
            .await?;

        let chain = parse_chain(&chain_pem).map_err(CertError::PolicyViolation)?;
        policy::validate_chain(&chain, &self.trust, Utc::now())?;
        let leaf = policy::validate_issued(&chain, request, &self.policy)?;

        Ok(IssuedCertificate { chain_pem, leaf })
    }

    /// Withdraw every presented challenge and release the order.
    async fn cleanup(&self, run: &mut Run) {
        for challenge in run.presented.drain(..) {
            if let Err(e) = self.solver.cleanup(&challenge).await {
                warn!(
                    identifier = %challenge.identifier,
                    error = %e,
                    "Challenge cleanup failed"
                );
            }
        }
        if let Some(order) = run.order.take() {
            self.authority.release(&order);
        }
    }

    /// Revoke a chain at the authority, with the same retry rules as issuance.
    pub async fn revoke(
        &self,
        identity: &Identity,
        chain_pem: &str,
        cancel: &CancellationToken,
    ) -> CertResult<OperationId> {
        let run = Run {
            identity: identity.clone(),
            operation: OperationId::new(),
            state: IssuanceState::Issued,
            order: None,
            presented: Vec::new(),
        };
        self.call("revoke", &run, cancel, || self.authority.revoke(chain_pem))
            .await?;
        Ok(run.operation)
    }

    /// One authority step: timeout, retry with backoff, cancellation.
    async fn call<T, F, Fut>(
        &self,
        step: &'static str,
        run: &Run,
        cancel: &CancellationToken,
        mut f: F,
    ) -> CertResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CertResult<T>>,
    {
        let mut backoff = Backoff::new(self.settings.retry.clone());
        loop {
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CertError::Cancelled),
                outcome = tokio::time::timeout(self.settings.step_timeout, f()) => outcome,
            };

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => CertError::Timeout {
                    operation: step.to_string(),
                    elapsed: started.elapsed(),
                },
            };
            if !error.is_transient() {
                return Err(error);
            }

            match backoff.record_failure() {
                BackoffStep::Retry(delay) => {
                    warn!(
                        identity = %run.identity,
                        operation = %run.operation,
                        step,
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    self.audit.record_or_warn(
                        &AuditRecord::new(&run.identity, AuditEvent::Retry, &run.operation)
                            .with_error(&error)
                            .with_detail(format!(
                                "{} attempt {} failed: {}",
                                step,
                                backoff.failures(),
                                error
                            )),
                    );
                    pause(cancel, delay).await?;
                }
                BackoffStep::Exhausted => {
                    debug!(step, attempts = backoff.failures(), "Giving up on step");
                    return Err(error);
                }
            }
        }
    }
}

impl fmt::Debug for IssuanceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuanceEngine")
            .field("authority", &self.authority.name())
            .field("solver", &self.solver.kind())
            .field("trust_anchors", &self.trust.len())
            .field("settings", &self.settings)
            .finish()
    }
}

async fn pause(cancel: &CancellationToken, delay: Duration) -> CertResult<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CertError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = CertResult<T>>,
) -> CertResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CertError::Cancelled),
        result = fut => result,
    }
}
