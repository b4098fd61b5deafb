//! Application context.
//!
//! [`CertManager`] owns everything one certctl invocation needs: the store,
//! the audit log, the issuance engine and the renewal task table. The CLI and
//! the scheduler share it explicitly; there is no global state.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use certctl_common::{CertError, CertResult, Identity, KeyAlgorithm, RenewalThreshold};
use certctl_config::Config;

use crate::audit::{AuditEvent, AuditLog, AuditRecord};
use crate::issuance::{
    authority_from_config, solver_from_config, Authority, ChallengeManager, ChallengeSolver,
    EngineSettings, IssuanceEngine, IssuanceKind,
};
use crate::policy::{self, Policy, TrustStore};
use crate::renewal::{
    is_due, renew_at, RenewalReport, RenewalScheduler, RenewalTask, Renewer, TaskRegistry,
    TaskState,
};
use crate::request::{CertificateRequest, RequestBuilder};
use crate::store::{CertStatus, CertStore, ExportedFiles, StoredCertificate};

/// Certificates this close to expiry are flagged in listings.
const EXPIRY_WARNING_DAYS: i64 = 30;

/// Input of [`CertManager::issue`].
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub subject: String,
    pub sans: Vec<String>,
    pub key_algorithm: KeyAlgorithm,
    /// Issue even if a matching, valid certificate exists.
    pub force: bool,
}

/// Result of [`CertManager::issue`].
#[derive(Debug, Clone)]
pub enum IssueOutcome {
    Issued(StoredCertificate),
    /// A matching certificate exists and is not due; nothing was done.
    Unchanged(StoredCertificate),
}

impl IssueOutcome {
    pub fn certificate(&self) -> &StoredCertificate {
        match self {
            Self::Issued(cert) | Self::Unchanged(cert) => cert,
        }
    }

    pub fn changed(&self) -> bool {
        matches!(self, Self::Issued(_))
    }
}

/// What [`CertManager::issue`] would do, from [`CertManager::plan_issue`].
#[derive(Debug, Clone, Serialize)]
pub struct IssuePlan {
    pub identity: Identity,
    pub action: PlannedAction,
    pub authority: String,
    /// The request that would be submitted. Its key is discarded.
    pub request: CertificateRequest,
    /// Serial of the active certificate the issuance would replace.
    pub replaces: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlannedAction {
    Issue,
    Reissue,
    Unchanged,
}

impl PlannedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Reissue => "reissue",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Result of [`CertManager::revoke`].
#[derive(Debug, Clone, Serialize)]
pub struct RevokeOutcome {
    pub identity: Identity,
    pub serial: String,
    /// Whether the certificate was removed from the store or kept as revoked.
    pub deleted: bool,
}

/// Renewal task as shown to the operator.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub state: TaskState,
    pub consecutive_failures: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<RenewalTask> for TaskView {
    fn from(task: RenewalTask) -> Self {
        Self {
            state: task.state,
            consecutive_failures: task.consecutive_failures,
            next_attempt_at: task.next_attempt_at,
            last_error: task
                .last_error
                .map(|e| format!("{}: {}", e.kind, e.message)),
        }
    }
}

/// A stored certificate with its renewal status, for `list` and `inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct CertificateView {
    pub identity: Identity,
    pub status: CertStatus,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub sans: Vec<String>,
    pub key_algorithm: KeyAlgorithm,
    pub key_id: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub days_left: i64,
    pub renew_at: DateTime<Utc>,
    pub due: bool,
    pub chain_len: usize,
    pub generation: u64,
    pub committed_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub previous_serial: Option<String>,
    pub renewal: Option<TaskView>,
    /// Expiring soon, expired, or renewal given up.
    pub needs_attention: bool,
}

impl CertificateView {
    fn new(
        cert: StoredCertificate,
        task: Option<RenewalTask>,
        threshold: RenewalThreshold,
        now: DateTime<Utc>,
    ) -> Self {
        let days_left = cert.info.remaining(now).num_days();
        let fatal = task
            .as_ref()
            .is_some_and(|t| t.state == TaskState::FailedFatal);
        let active = cert.status == CertStatus::Active;

        Self {
            renew_at: renew_at(&cert.info, threshold),
            due: active && is_due(&cert.info, threshold, now),
            needs_attention: active
                && (fatal || cert.info.is_expired(now) || days_left < EXPIRY_WARNING_DAYS),
            days_left,
            identity: cert.identity,
            status: cert.status,
            subject: cert.info.subject,
            issuer: cert.info.issuer,
            serial: cert.info.serial,
            sans: cert.info.sans,
            key_algorithm: cert.key_algorithm,
            key_id: cert.key_id.as_str().to_string(),
            not_before: cert.info.not_before,
            not_after: cert.info.not_after,
            chain_len: cert.chain_len,
            generation: cert.generation,
            committed_at: cert.committed_at,
            revoked_at: cert.revoked_at,
            previous_serial: cert.previous_serial,
            renewal: task.map(TaskView::from),
        }
    }
}

/// Rebuilds the request of a stored certificate and runs it through the
/// engine. Shared with the scheduler.
struct StoreRenewer {
    store: Arc<CertStore>,
    builder: RequestBuilder,
    engine: Arc<IssuanceEngine>,
}

impl StoreRenewer {
    async fn reissue(
        &self,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> CertResult<StoredCertificate> {
        let current = self.store.require(identity)?;
        if current.status == CertStatus::Revoked {
            return Err(CertError::PolicyViolation(format!(
                "certificate for {} is revoked; issue a new one instead",
                identity
            )));
        }

        let built =
            self.builder
                .build(identity.as_str(), &current.info.sans, current.key_algorithm)?;
        self.engine.issue(built, IssuanceKind::Renew, cancel).await?;
        self.store.require(identity)
    }
}

#[async_trait]
impl Renewer for StoreRenewer {
    async fn renew(&self, identity: &Identity, cancel: &CancellationToken) -> CertResult<()> {
        self.reissue(identity, cancel).await.map(|_| ())
    }
}

/// Explicit application context.
pub struct CertManager {
    config: Config,
    store: Arc<CertStore>,
    audit: Arc<AuditLog>,
    policy: Arc<Policy>,
    engine: Arc<IssuanceEngine>,
    renewer: Arc<StoreRenewer>,
    tasks: Arc<TaskRegistry>,
    responder: ChallengeManager,
}

impl CertManager {
    /// Validate the configuration, open the store and connect the
    /// configured authority.
    pub async fn from_config(config: Config) -> CertResult<Self> {
        config
            .validate()
            .into_result()
            .map_err(|e| CertError::PolicyViolation(e.to_string()))?;
        let store = Arc::new(CertStore::open(&config.store.path, &config.store.key_env)?);
        let responder = ChallengeManager::new();
        let authority = authority_from_config(&config.authority, &store, &responder).await?;
        let solver = solver_from_config(&config.authority, &responder);
        Self::with_authority(config, store, authority, solver, responder)
    }

    /// Assemble a manager around an already constructed authority.
    pub fn with_authority(
        config: Config,
        store: Arc<CertStore>,
        authority: Arc<dyn Authority>,
        solver: Arc<dyn ChallengeSolver>,
        responder: ChallengeManager,
    ) -> CertResult<Self> {
        let mut trust = TrustStore::with_public_roots();
        for path in &config.policy.trust_anchors {
            let added = trust.add_pem_file(path)?;
            debug!(path = %path.display(), added, "Loaded trust anchors");
        }
        for anchor in authority.trust_anchors() {
            trust.add_der(&anchor).map_err(|e| {
                CertError::integrity(authority.name(), format!("authority root: {}", e))
            })?;
        }

        let policy = Arc::new(Policy::from(&config.policy));
        let audit = Arc::new(AuditLog::new(store.audit_path()));
        let engine = Arc::new(IssuanceEngine::new(
            authority,
            solver,
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::clone(&policy),
            Arc::new(trust),
            EngineSettings::from(&config.issuance),
        ));
        let validity_days = config
            .authority
            .local_validity_days
            .min(config.policy.max_validity_days);
        let renewer = Arc::new(StoreRenewer {
            store: Arc::clone(&store),
            builder: RequestBuilder::new(Arc::clone(&policy), validity_days),
            engine: Arc::clone(&engine),
        });
        let tasks = Arc::new(TaskRegistry::open(
            Arc::clone(&store),
            config.renewal.retry_policy(),
        )?);

        info!(
            store = %store.root().display(),
            authority = engine.authority().name(),
            tasks = tasks.len(),
            "Certificate manager ready"
        );

        Ok(Self {
            config,
            store,
            audit,
            policy,
            engine,
            renewer,
            tasks,
            responder,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<CertStore> {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// In-process HTTP-01 responder, for embedding certctl in a server.
    pub fn responder(&self) -> &ChallengeManager {
        &self.responder
    }

    pub fn scheduler(&self) -> RenewalScheduler {
        RenewalScheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.tasks),
            Arc::clone(&self.renewer) as Arc<dyn Renewer>,
            Arc::clone(&self.audit),
            &self.config.renewal,
        )
    }

    /// Run every check [`issue`](Self::issue) runs without placing an order
    /// or writing a certificate.
    pub fn plan_issue(&self, request: &IssueRequest) -> CertResult<IssuePlan> {
        let names = policy::validate_request(&request.subject, &request.sans, &self.policy)?;
        let identity = Identity::new(&names[0])?;
        let existing = self
            .store
            .get(&identity)?
            .filter(|c| c.status == CertStatus::Active);

        let action = match &existing {
            Some(current)
                if !request.force && self.matches(current, &names, request.key_algorithm) =>
            {
                PlannedAction::Unchanged
            }
            Some(_) => PlannedAction::Reissue,
            None => PlannedAction::Issue,
        };
        let built = self
            .renewer
            .builder
            .build(&request.subject, &request.sans, request.key_algorithm)?;
        debug!(identity = %identity, action = action.as_str(), "Planned issuance");

        Ok(IssuePlan {
            identity,
            action,
            authority: self.engine.authority().name().to_string(),
            request: built.request,
            replaces: existing.map(|c| c.info.serial),
        })
    }

    /// Issue a certificate.
    ///
    /// A no-op when an active certificate with the same names and key
    /// algorithm exists and is not yet due, unless `force` is set.
    pub async fn issue(
        &self,
        request: IssueRequest,
        cancel: &CancellationToken,
    ) -> CertResult<IssueOutcome> {
        let names = policy::validate_request(&request.subject, &request.sans, &self.policy)?;
        let identity = Identity::new(&names[0])?;
        let existing = self
            .store
            .get(&identity)?
            .filter(|c| c.status == CertStatus::Active);

        if let Some(current) = &existing {
            if !request.force && self.matches(current, &names, request.key_algorithm) {
                info!(
                    identity = %identity,
                    not_after = %current.info.not_after,
                    "Matching certificate is valid, nothing to do"
                );
                return Ok(IssueOutcome::Unchanged(current.clone()));
            }
        }

        let kind = if existing.is_some() {
            IssuanceKind::Renew
        } else {
            IssuanceKind::Issue
        };
        let built = self
            .renewer
            .builder
            .build(&request.subject, &request.sans, request.key_algorithm)?;
        let _lease = self.store.lease(&identity)?;
        self.engine.issue(built, kind, cancel).await?;

        self.tasks.remove(&identity)?;
        Ok(IssueOutcome::Issued(self.store.require(&identity)?))
    }

    fn matches(&self, current: &StoredCertificate, names: &[String], alg: KeyAlgorithm) -> bool {
        let mut have = current.info.sans.clone();
        let mut want = names.to_vec();
        have.sort();
        want.sort();
        have == want
            && current.key_algorithm == alg
            && !is_due(&current.info, self.config.renewal.threshold(), Utc::now())
    }

    /// Renew one identity now, whatever its threshold or task state.
    pub async fn renew(
        &self,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> CertResult<StoredCertificate> {
        if self.store.require(identity)?.status == CertStatus::Revoked {
            return Err(CertError::PolicyViolation(format!(
                "certificate for {} is revoked; issue a new one instead",
                identity
            )));
        }
        if self.store.is_leased(identity)? {
            return Err(CertError::InternalStore(format!(
                "{} is being issued, renewed or revoked by another operation",
                identity
            )));
        }
        let now = Utc::now();
        self.tasks.reset(identity, now)?;
        let Some(claim) = self.tasks.claim(identity, now)? else {
            return Err(CertError::InternalStore(format!(
                "a renewal of {} is already in flight",
                identity
            )));
        };

        let result = self.renewer.reissue(identity, cancel).await;
        match &result {
            Ok(_) => {
                self.tasks.complete(claim)?;
            }
            Err(CertError::Cancelled) => self.tasks.release(claim)?,
            Err(e) => {
                if let Some(task) = self.tasks.fail(claim, e, Utc::now())? {
                    warn!(
                        identity = %identity,
                        failures = task.consecutive_failures,
                        state = %task.state,
                        "Explicit renewal failed"
                    );
                }
                self.audit.record_or_warn(
                    &AuditRecord::new(
                        identity,
                        AuditEvent::RenewalFailed,
                        &certctl_common::OperationId::new(),
                    )
                    .with_error(e),
                );
            }
        }
        result
    }

    /// Renew everything past its threshold.
    pub async fn renew_due(&self, cancel: &CancellationToken) -> CertResult<RenewalReport> {
        self.scheduler().run_once(cancel).await
    }

    /// Revoke at the authority, then delete or retain per policy.
    pub async fn revoke(
        &self,
        identity: &Identity,
        cancel: &CancellationToken,
    ) -> CertResult<RevokeOutcome> {
        let current = self.store.require(identity)?;
        if current.status == CertStatus::Revoked {
            return Err(CertError::PolicyViolation(format!(
                "certificate for {} is already revoked",
                identity
            )));
        }
        let _lease = self.store.lease(identity)?;

        let operation = self
            .engine
            .revoke(identity, &current.chain_pem, cancel)
            .await?;
        self.audit.record_or_warn(
            &AuditRecord::new(identity, AuditEvent::Revoked, &operation)
                .with_detail(format!("serial {}", current.info.serial)),
        );

        let deleted = if self.config.policy.retain_revoked {
            self.store.mark_revoked(identity)?;
            false
        } else {
            self.store.delete(identity)?;
            self.audit.record_or_warn(&AuditRecord::new(
                identity,
                AuditEvent::Deleted,
                &operation,
            ));
            true
        };

        self.tasks.remove(identity)?;
        info!(identity = %identity, serial = %current.info.serial, deleted, "Certificate revoked");

        Ok(RevokeOutcome {
            identity: identity.clone(),
            serial: current.info.serial,
            deleted,
        })
    }

    /// Write the identity's chain and key as plain PEM files under `out_dir`.
    pub fn export(&self, identity: &Identity, out_dir: &Path) -> CertResult<ExportedFiles> {
        let files = self.store.export(identity, out_dir)?;
        self.audit.record_or_warn(
            &AuditRecord::new(
                identity,
                AuditEvent::Exported,
                &certctl_common::OperationId::new(),
            )
            .with_detail(files.cert_path.display().to_string()),
        );
        Ok(files)
    }

    pub fn list(&self) -> CertResult<Vec<CertificateView>> {
        self.tasks.refresh()?;
        let now = Utc::now();
        let threshold = self.config.renewal.threshold();
        Ok(self
            .store
            .list()?
            .into_iter()
            .map(|cert| {
                let task = self.tasks.get(&cert.identity);
                CertificateView::new(cert, task, threshold, now)
            })
            .collect())
    }

    pub fn inspect(&self, identity: &Identity) -> CertResult<CertificateView> {
        let cert = self.store.require(identity)?;
        self.tasks.refresh()?;
        let task = self.tasks.get(identity);
        Ok(CertificateView::new(
            cert,
            task,
            self.config.renewal.threshold(),
            Utc::now(),
        ))
    }
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("store", &self.store)
            .field("engine", &self.engine)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuance::LocalAuthority;
    use crate::store::MasterKey;
    use tempfile::TempDir;

    fn manager(configure: impl FnOnce(&mut Config)) -> (TempDir, CertManager) {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.path = dir.path().to_path_buf();
        configure(&mut config);

        let store = Arc::new(CertStore::open_with_key(dir.path(), MasterKey::generate()).unwrap());
        let responder = ChallengeManager::new();
        let authority = Arc::new(
            LocalAuthority::open(&store, "App Test CA", 90, responder.clone()).unwrap(),
        );
        let manager = CertManager::with_authority(
            config,
            store,
            authority,
            Arc::new(responder.clone()),
            responder,
        )
        .unwrap();
        (dir, manager)
    }

    fn request(subject: &str, sans: &[&str]) -> IssueRequest {
        IssueRequest {
            subject: subject.to_string(),
            sans: sans.iter().map(|s| s.to_string()).collect(),
            key_algorithm: KeyAlgorithm::EcdsaP256,
            force: false,
        }
    }

    #[tokio::test]
    async fn test_issue_then_inspect() {
        let (_dir, manager) = manager(|_| {});
        let cancel = CancellationToken::new();

        let outcome = manager
            .issue(request("example.com", &["www.example.com"]), &cancel)
            .await
            .unwrap();
        assert!(outcome.changed());

        let view = manager
            .inspect(&Identity::new("example.com").unwrap())
            .unwrap();
        assert_eq!(view.sans, vec!["example.com", "www.example.com"]);
        assert_eq!(view.status, CertStatus::Active);
        assert!(!view.due);
        assert!(view.renewal.is_none());
        assert_eq!(view.days_left, 89);
    }

    #[tokio::test]
    async fn test_issue_is_idempotent_unless_forced() {
        let (_dir, manager) = manager(|_| {});
        let cancel = CancellationToken::new();

        let first = manager.issue(request("example.com", &[]), &cancel).await.unwrap();
        let again = manager.issue(request("example.com", &[]), &cancel).await.unwrap();
        assert!(!again.changed());
        assert_eq!(again.certificate().info.serial, first.certificate().info.serial);

        let mut forced = request("example.com", &[]);
        forced.force = true;
        let forced = manager.issue(forced, &cancel).await.unwrap();
        assert!(forced.changed());
        assert_ne!(forced.certificate().info.serial, first.certificate().info.serial);
        assert_eq!(
            forced.certificate().previous_serial.as_deref(),
            Some(first.certificate().info.serial.as_str())
        );

        // Changed names are a new issuance for the same identity.
        let widened = manager
            .issue(request("example.com", &["api.example.com"]), &cancel)
            .await
            .unwrap();
        assert!(widened.changed());
    }

    #[tokio::test]
    async fn test_revoke_deletes_by_default() {
        let (_dir, manager) = manager(|_| {});
        let cancel = CancellationToken::new();
        let identity = Identity::new("example.com").unwrap();
        manager.issue(request("example.com", &[]), &cancel).await.unwrap();

        let outcome = manager.revoke(&identity, &cancel).await.unwrap();
        assert!(outcome.deleted);

        let err = manager.inspect(&identity).unwrap_err();
        assert_eq!(err.kind(), certctl_common::ErrorKind::NotFound);
        assert_eq!(err.exit_code(), 3);

        let events: Vec<AuditEvent> = manager
            .audit()
            .for_identity(&identity)
            .unwrap()
            .into_iter()
            .map(|r| r.event)
            .collect();
        assert_eq!(
            events,
            vec![AuditEvent::Issued, AuditEvent::Revoked, AuditEvent::Deleted]
        );
    }

    #[tokio::test]
    async fn test_revoke_can_retain() {
        let (_dir, manager) = manager(|c| c.policy.retain_revoked = true);
        let cancel = CancellationToken::new();
        let identity = Identity::new("example.com").unwrap();
        manager.issue(request("example.com", &[]), &cancel).await.unwrap();

        let outcome = manager.revoke(&identity, &cancel).await.unwrap();
        assert!(!outcome.deleted);

        let view = manager.inspect(&identity).unwrap();
        assert_eq!(view.status, CertStatus::Revoked);
        assert!(!view.due);
        assert!(manager.revoke(&identity, &cancel).await.is_err());
        assert!(manager.renew(&identity, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_explicit_renew_replaces_certificate() {
        let (_dir, manager) = manager(|_| {});
        let cancel = CancellationToken::new();
        let identity = Identity::new("example.com").unwrap();
        let first = manager.issue(request("example.com", &[]), &cancel).await.unwrap();

        let renewed = manager.renew(&identity, &cancel).await.unwrap();
        assert_ne!(renewed.info.serial, first.certificate().info.serial);
        assert!(manager.tasks().get(&identity).is_none());

        let last = manager.audit().for_identity(&identity).unwrap().pop().unwrap();
        assert_eq!(last.event, AuditEvent::Renewed);
    }

    #[tokio::test]
    async fn test_renew_unknown_identity() {
        let (_dir, manager) = manager(|_| {});
        let err = manager
            .renew(&Identity::new("missing.example.com").unwrap(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), certctl_common::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_renew_due_with_fixed_window() {
        let (_dir, manager) = manager(|c| c.renewal.renew_before_days = Some(365));
        let cancel = CancellationToken::new();
        manager.issue(request("a.example.com", &[]), &cancel).await.unwrap();

        let report = manager.renew_due(&cancel).await.unwrap();
        assert_eq!(report.renewed.len(), 1);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_from_config_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.store.path = dir.path().join("store");
        config.issuance.max_attempts = 0;

        let err = CertManager::from_config(config).await.unwrap_err();
        assert_eq!(err.kind(), certctl_common::ErrorKind::PolicyViolation);
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("configuration has 1 error(s)"));
        assert!(!dir.path().join("store").exists());
    }

    #[tokio::test]
    async fn test_leased_identity_refuses_other_operations() {
        let (_dir, manager) = manager(|_| {});
        let cancel = CancellationToken::new();
        let identity = Identity::new("example.com").unwrap();
        manager.issue(request("example.com", &[]), &cancel).await.unwrap();

        let lease = manager.store().lease(&identity).unwrap();
        let mut forced = request("example.com", &[]);
        forced.force = true;
        let err = manager.issue(forced.clone(), &cancel).await.unwrap_err();
        assert_eq!(err.kind(), certctl_common::ErrorKind::InternalStoreError);
        assert!(manager.renew(&identity, &cancel).await.is_err());
        assert!(manager.revoke(&identity, &cancel).await.is_err());
        assert_eq!(manager.inspect(&identity).unwrap().status, CertStatus::Active);

        drop(lease);
        assert!(manager.inspect(&identity).unwrap().renewal.is_none());
        assert!(manager.issue(forced, &cancel).await.unwrap().changed());
    }

    #[tokio::test]
    async fn test_plan_issue_writes_nothing() {
        let (_dir, manager) = manager(|_| {});
        let cancel = CancellationToken::new();

        let plan = manager
            .plan_issue(&request("example.com", &["www.example.com"]))
            .unwrap();
        assert_eq!(plan.action, PlannedAction::Issue);
        assert_eq!(plan.request.sans, vec!["example.com", "www.example.com"]);
        assert!(plan.replaces.is_none());
        assert!(plan.request.csr_pem.contains("CERTIFICATE REQUEST"));
        assert!(manager.list().unwrap().is_empty());
        assert!(!manager.store().audit_path().exists());

        let issued = manager.issue(request("example.com", &[]), &cancel).await.unwrap();
        let plan = manager.plan_issue(&request("example.com", &[])).unwrap();
        assert_eq!(plan.action, PlannedAction::Unchanged);

        let plan = manager
            .plan_issue(&request("example.com", &["api.example.com"]))
            .unwrap();
        assert_eq!(plan.action, PlannedAction::Reissue);
        assert_eq!(
            plan.replaces.as_deref(),
            Some(issued.certificate().info.serial.as_str())
        );
        assert_eq!(manager.list().unwrap().len(), 1);

        let err = manager
            .plan_issue(&request("exa mple.com", &[]))
            .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_export_round_trip() {
        let (dir, manager) = manager(|_| {});
        let cancel = CancellationToken::new();
        let identity = Identity::new("example.com").unwrap();
        let issued = manager.issue(request("example.com", &[]), &cancel).await.unwrap();

        let out = dir.path().join("certs");
        let files = manager.export(&identity, &out).unwrap();
        assert_eq!(
            std::fs::read_to_string(&files.cert_path).unwrap(),
            issued.certificate().chain_pem
        );
        let key = crate::request::KeyPair::from_pem(
            &std::fs::read_to_string(&files.key_path).unwrap(),
        )
        .unwrap();
        assert_eq!(key.key_id(), &issued.certificate().key_id);

        let last = manager.audit().for_identity(&identity).unwrap().pop().unwrap();
        assert_eq!(last.event, AuditEvent::Exported);
    }
}
