//! Background certificate renewal.
//!
//! Periodically scans the store, queues every certificate that crossed its
//! renewal threshold and renews the queued identities in parallel.

mod task;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certctl_common::{CertError, CertResult, Identity, OperationId, RenewalThreshold};
use certctl_config::RenewalConfig;

use crate::audit::{AuditEvent, AuditLog, AuditRecord};
use crate::certinfo::CertInfo;
use crate::store::{CertStatus, CertStore};

pub use task::{Claim, RenewalTask, TaskError, TaskRegistry, TaskState, TASKS_STATE};

/// Minimum interval between scans in `run` mode.
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Point in time from which a certificate is due for renewal.
pub fn renew_at(info: &CertInfo, threshold: RenewalThreshold) -> DateTime<Utc> {
    let window = match threshold {
        RenewalThreshold::RemainingFraction(fraction) => {
            let millis = info.lifetime().num_milliseconds() as f64 * fraction.clamp(0.0, 1.0);
            chrono::Duration::milliseconds(millis.round() as i64)
        }
        RenewalThreshold::BeforeExpiry(before) => {
            chrono::Duration::from_std(before).unwrap_or(chrono::Duration::MAX)
        }
    };
    info.not_after
        .checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// A certificate exactly at its threshold is due.
pub fn is_due(info: &CertInfo, threshold: RenewalThreshold, now: DateTime<Utc>) -> bool {
    now >= renew_at(info, threshold)
}

/// Re-issues the certificate of an identity.
#[async_trait]
pub trait Renewer: Send + Sync {
    async fn renew(&self, identity: &Identity, cancel: &CancellationToken) -> CertResult<()>;
}

/// Outcome of one scheduler pass.
#[derive(Debug, Default)]
pub struct RenewalReport {
    /// Identities newly queued by the scan.
    pub queued: Vec<Identity>,
    pub renewed: Vec<Identity>,
    /// Failed attempts that will be retried later.
    pub failed: Vec<(Identity, CertError)>,
    /// Tasks that ran out of attempts during this pass.
    pub fatal: Vec<Identity>,
}

impl RenewalReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.fatal.is_empty()
    }

    /// First failure of the pass, for the exit code.
    pub fn first_error(&self) -> Option<&CertError> {
        self.failed.first().map(|(_, e)| e)
    }
}

enum Attempt {
    Renewed,
    Failed(CertError),
    Fatal(CertError),
    Interrupted,
}

/// Certificate renewal scheduler.
///
/// Renewals of different identities run in parallel up to `max_concurrent`;
/// the task table guarantees one in-flight renewal per identity.
pub struct RenewalScheduler {
    store: Arc<CertStore>,
    tasks: Arc<TaskRegistry>,
    renewer: Arc<dyn Renewer>,
    audit: Arc<AuditLog>,
    threshold: RenewalThreshold,
    check_interval: Duration,
    max_concurrent: usize,
}

impl RenewalScheduler {
    pub fn new(
        store: Arc<CertStore>,
        tasks: Arc<TaskRegistry>,
        renewer: Arc<dyn Renewer>,
        audit: Arc<AuditLog>,
        config: &RenewalConfig,
    ) -> Self {
        Self {
            store,
            tasks,
            renewer,
            audit,
            threshold: config.threshold(),
            check_interval: config.check_interval().max(MIN_CHECK_INTERVAL),
            max_concurrent: config.max_concurrent.max(1),
        }
    }

    pub fn threshold(&self) -> RenewalThreshold {
        self.threshold
    }

    /// Run until cancelled. The first pass starts immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            max_concurrent = self.max_concurrent,
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            debug!("Running scheduled certificate renewal check");
            match self.run_once(&cancel).await {
                Ok(report) if !report.is_success() => warn!(
                    renewed = report.renewed.len(),
                    failed = report.failed.len(),
                    fatal = report.fatal.len(),
                    "Renewal pass finished with failures"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Certificate renewal check failed"),
            }
        }

        info!("Renewal scheduler stopped");
    }

    /// Queue due certificates and drop tasks whose certificate is gone.
    ///
    /// Returns the identities newly queued.
    pub fn scan(&self, now: DateTime<Utc>) -> CertResult<Vec<Identity>> {
        let certificates = self.store.list()?;
        info!(certificates = certificates.len(), "Checking certificates for renewal");
        self.tasks.refresh()?;

        let mut queued = Vec::new();
        for cert in &certificates {
            if cert.status == CertStatus::Revoked {
                continue;
            }
            if !is_due(&cert.info, self.threshold, now) {
                debug!(
                    identity = %cert.identity,
                    renew_at = %renew_at(&cert.info, self.threshold),
                    "Certificate is still valid"
                );
                continue;
            }
            if self.tasks.enqueue(&cert.identity, now)? {
                info!(
                    identity = %cert.identity,
                    not_after = %cert.info.not_after,
                    "Certificate needs renewal"
                );
                queued.push(cert.identity.clone());
            }
        }

        for task in self.tasks.snapshot() {
            let stored = certificates
                .iter()
                .any(|c| c.identity == task.identity && c.status == CertStatus::Active);
            if !stored && task.state != TaskState::InFlight {
                debug!(identity = %task.identity, "Dropping task for missing certificate");
                self.tasks.remove(&task.identity)?;
            }
        }

        Ok(queued)
    }

    /// One pass: scan, then renew every ready task.
    pub async fn run_once(&self, cancel: &CancellationToken) -> CertResult<RenewalReport> {
        let now = Utc::now();
        let mut report = RenewalReport {
            queued: self.scan(now)?,
            ..RenewalReport::default()
        };

        let ready = self.tasks.ready(now);
        if ready.is_empty() {
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut running = JoinSet::new();
        for identity in ready {
            let claim = match self.tasks.claim(&identity, now) {
                Ok(Some(claim)) => claim,
                Ok(None) => continue,
                Err(e) => {
                    error!(identity = %identity, error = %e, "Failed to claim renewal task");
                    report.failed.push((identity, e));
                    continue;
                }
            };
            let permits = Arc::clone(&permits);
            let renewer = Arc::clone(&self.renewer);
            let tasks = Arc::clone(&self.tasks);
            let audit = Arc::clone(&self.audit);
            let cancel = cancel.child_token();

            running.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    if let Err(e) = tasks.release(claim) {
                        warn!(identity = %identity, error = %e, "Failed to release renewal task");
                    }
                    return (identity, Attempt::Interrupted);
                };
                let attempt = attempt(renewer.as_ref(), &tasks, &audit, claim, &cancel).await;
                (identity, attempt)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((identity, Attempt::Renewed)) => report.renewed.push(identity),
                Ok((identity, Attempt::Failed(e))) => report.failed.push((identity, e)),
                Ok((identity, Attempt::Fatal(e))) => {
                    report.fatal.push(identity.clone());
                    report.failed.push((identity, e));
                }
                Ok((_, Attempt::Interrupted)) => {}
                Err(e) => error!(error = %e, "Renewal task panicked"),
            }
        }

        info!(
            renewed = report.renewed.len(),
            failed = report.failed.len(),
            "Renewal pass completed"
        );
        Ok(report)
    }
}

/// Renew one claimed task and settle it in the table.
///
/// The claim, and with it the identity's lease, is held until the outcome
/// is recorded.
async fn attempt(
    renewer: &dyn Renewer,
    tasks: &TaskRegistry,
    audit: &AuditLog,
    claim: Claim,
    cancel: &CancellationToken,
) -> Attempt {
    let identity = claim.identity().clone();
    let identity = &identity;
    match renewer.renew(identity, cancel).await {
        Ok(()) => {
            if let Err(e) = tasks.complete(claim) {
                warn!(identity = %identity, error = %e, "Failed to record renewal");
            }
            info!(identity = %identity, "Certificate renewed successfully");
            Attempt::Renewed
        }
        Err(CertError::Cancelled) => {
            if let Err(e) = tasks.release(claim) {
                warn!(identity = %identity, error = %e, "Failed to release renewal task");
            }
            debug!(identity = %identity, "Renewal interrupted");
            Attempt::Interrupted
        }
        Err(e) => {
            let settled = tasks.fail(claim, &e, Utc::now()).unwrap_or_else(|store_err| {
                warn!(identity = %identity, error = %store_err, "Failed to record renewal failure");
                None
            });
            let failures = settled.as_ref().map_or(0, |t| t.consecutive_failures);
            let fatal = settled
                .as_ref()
                .is_some_and(|t| t.state == TaskState::FailedFatal);

            error!(
                identity = %identity,
                failures,
                fatal,
                error = %e,
                "Certificate renewal failed"
            );
            audit.record_or_warn(
                &AuditRecord::new(identity, AuditEvent::RenewalFailed, &OperationId::new())
                    .with_error(&e)
                    .with_detail(format!(
                        "renewal failure {}{}: {}",
                        failures,
                        if fatal { " (giving up)" } else { "" },
                        e
                    )),
            );

            if fatal {
                Attempt::Fatal(e)
            } else {
                Attempt::Failed(e)
            }
        }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("threshold", &self.threshold)
            .field("check_interval", &self.check_interval)
            .field("max_concurrent", &self.max_concurrent)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuance::{
        Authority, ChallengeManager, EngineSettings, IssuanceEngine, IssuanceKind, LocalAuthority,
    };
    use crate::policy::{Policy, TrustStore};
    use crate::request::RequestBuilder;
    use crate::store::MasterKey;
    use crate::testutil::TestCa;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn info_with(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> CertInfo {
        let ca = TestCa::new("Threshold CA");
        let (chain, _) = ca.issue(&["example.com"], 90);
        let mut info = CertInfo::from_der(&chain[0]).unwrap();
        info.not_before = not_before;
        info.not_after = not_after;
        info
    }

    #[test]
    fn test_fraction_threshold_boundary() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let info = info_with(start, start + chrono::Duration::days(90));
        let threshold = RenewalThreshold::RemainingFraction(1.0 / 3.0);

        let at = renew_at(&info, threshold);
        assert_eq!(at, start + chrono::Duration::days(60));
        assert!(is_due(&info, threshold, at));
        assert!(!is_due(&info, threshold, at - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_fixed_window_threshold_boundary() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let info = info_with(start, start + chrono::Duration::days(90));
        let threshold = RenewalThreshold::BeforeExpiry(Duration::from_secs(30 * 86400));

        let at = renew_at(&info, threshold);
        assert_eq!(at, info.not_after - chrono::Duration::days(30));
        assert!(is_due(&info, threshold, at));
        assert!(!is_due(&info, threshold, at - chrono::Duration::seconds(1)));
        assert!(is_due(&info, threshold, info.not_after + chrono::Duration::days(1)));
    }

    struct CountingRenewer {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Renewer for CountingRenewer {
        async fn renew(&self, _identity: &Identity, _cancel: &CancellationToken) -> CertResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CertError::AuthorityUnreachable("authority down".to_string()))
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<CertStore>,
        audit: Arc<AuditLog>,
        tasks: Arc<TaskRegistry>,
    }

    /// A store holding one certificate per name, issued with `days` of validity.
    async fn fixture(names: &[&str], days: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CertStore::open_with_key(dir.path(), MasterKey::generate()).unwrap());
        let audit = Arc::new(AuditLog::new(store.audit_path()));
        let responder = ChallengeManager::new();
        let authority = Arc::new(LocalAuthority::generate("Test CA", days, responder.clone()).unwrap());

        let mut trust = TrustStore::empty();
        for anchor in authority.trust_anchors() {
            trust.add_der(&anchor).unwrap();
        }
        let policy = Arc::new(Policy::default());
        let engine = IssuanceEngine::new(
            authority,
            Arc::new(responder),
            Arc::clone(&store),
            Arc::clone(&audit),
            Arc::clone(&policy),
            Arc::new(trust),
            EngineSettings::default(),
        );
        let builder = RequestBuilder::new(policy, days);
        let cancel = CancellationToken::new();
        for name in names {
            let built = builder
                .build(name, &[name.to_string()], certctl_common::KeyAlgorithm::EcdsaP256)
                .unwrap();
            engine.issue(built, IssuanceKind::Issue, &cancel).await.unwrap();
        }

        let tasks = TaskRegistry::open(Arc::clone(&store), RenewalConfig::default().retry_policy())
            .unwrap();
        Fixture {
            _dir: dir,
            store,
            audit,
            tasks: Arc::new(tasks),
        }
    }

    fn scheduler(fixture: &Fixture, renewer: Arc<dyn Renewer>, config: RenewalConfig) -> RenewalScheduler {
        RenewalScheduler::new(
            Arc::clone(&fixture.store),
            Arc::clone(&fixture.tasks),
            renewer,
            Arc::clone(&fixture.audit),
            &config,
        )
    }

    #[tokio::test]
    async fn test_scan_queues_only_due_certificates() {
        let fixture = fixture(&["a.example.com", "b.example.com"], 90).await;
        let renewer = Arc::new(CountingRenewer { calls: AtomicU32::new(0), fail: false });
        let scheduler = scheduler(&fixture, renewer, RenewalConfig::default());

        assert!(scheduler.scan(Utc::now()).unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::days(61);
        let queued = scheduler.scan(later).unwrap();
        assert_eq!(queued.len(), 2);
        // A second scan finds the tasks already queued.
        assert!(scheduler.scan(later).unwrap().is_empty());
        assert_eq!(fixture.tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_run_once_renews_due_certificates() {
        let fixture = fixture(&["a.example.com", "b.example.com"], 90).await;
        let renewer = Arc::new(CountingRenewer { calls: AtomicU32::new(0), fail: false });
        let mut config = RenewalConfig::default();
        config.renew_before_days = Some(365);
        let scheduler = scheduler(&fixture, renewer.clone(), config);

        let report = scheduler.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.queued.len(), 2);
        assert_eq!(report.renewed.len(), 2);
        assert!(report.is_success());
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 2);
        assert!(fixture.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_renewals_are_audited_and_turn_fatal() {
        let fixture = fixture(&["example.com"], 90).await;
        let renewer = Arc::new(CountingRenewer { calls: AtomicU32::new(0), fail: true });
        let mut config = RenewalConfig::default();
        config.renew_before_days = Some(365);
        config.max_consecutive_failures = 1;
        let scheduler = scheduler(&fixture, renewer.clone(), config);
        let cancel = CancellationToken::new();

        let report = scheduler.run_once(&cancel).await.unwrap();
        assert_eq!(report.fatal.len(), 1);
        assert_eq!(
            report.first_error().unwrap().kind(),
            certctl_common::ErrorKind::AuthorityUnreachable
        );

        let identity = Identity::new("example.com").unwrap();
        assert_eq!(fixture.tasks.get(&identity).unwrap().state, TaskState::FailedFatal);
        let events: Vec<AuditEvent> = fixture
            .audit
            .for_identity(&identity)
            .unwrap()
            .into_iter()
            .map(|r| r.event)
            .collect();
        assert_eq!(events.last(), Some(&AuditEvent::RenewalFailed));

        // Fatal tasks wait for the operator.
        let report = scheduler.run_once(&cancel).await.unwrap();
        assert!(report.renewed.is_empty() && report.failed.is_empty());
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);

        // The table survives a restart.
        let reloaded = TaskRegistry::open(
            Arc::clone(&fixture.store),
            RenewalConfig::default().retry_policy(),
        )
        .unwrap();
        assert_eq!(reloaded.get(&identity).unwrap().state, TaskState::FailedFatal);
    }

    #[tokio::test]
    async fn test_leased_identity_is_left_alone() {
        let fixture = fixture(&["a.example.com", "b.example.com"], 90).await;
        let renewer = Arc::new(CountingRenewer { calls: AtomicU32::new(0), fail: false });
        let mut config = RenewalConfig::default();
        config.renew_before_days = Some(365);
        let scheduler = scheduler(&fixture, renewer.clone(), config);

        // Another process is revoking a.example.com.
        let busy = Identity::new("a.example.com").unwrap();
        let lease = fixture.store.lease(&busy).unwrap();

        let report = scheduler.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.renewed, vec![Identity::new("b.example.com").unwrap()]);
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.tasks.get(&busy).unwrap().state, TaskState::Pending);

        drop(lease);
        let report = scheduler.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.renewed, vec![busy]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let fixture = fixture(&[], 90).await;
        let renewer = Arc::new(CountingRenewer { calls: AtomicU32::new(0), fail: false });
        let scheduler = scheduler(&fixture, renewer, RenewalConfig::default());
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), scheduler.run(cancel))
            .await
            .unwrap();
    }
}
