//! End-to-end lifecycle scenarios against in-process authorities.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use rustls_pki_types::CertificateDer;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use certctl::issuance::{Challenge, OrderToken, Submission, ValidationStatus};
use certctl::renewal::{is_due, renew_at};
use certctl::{
    AuditEvent, Authority, CertManager, CertStatus, CertStore, CertificateRequest,
    ChallengeManager, IssueRequest, LocalAuthority, MasterKey, TaskRegistry, TaskState,
};
use certctl_common::{
    CertError, CertResult, ChallengeKind, ErrorKind, Identity, KeyAlgorithm, RenewalThreshold,
    RetryPolicy,
};
use certctl_config::Config;

/// Local CA that fails the first `submit_timeouts` submissions with a
/// timeout and records every chain it hands out.
struct FlakyAuthority {
    inner: LocalAuthority,
    submit_timeouts: AtomicU32,
    issued: Mutex<Vec<String>>,
}

impl FlakyAuthority {
    fn new(responder: ChallengeManager, submit_timeouts: u32) -> Self {
        Self {
            inner: LocalAuthority::generate("Lifecycle CA", 90, responder).unwrap(),
            submit_timeouts: AtomicU32::new(submit_timeouts),
            issued: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Authority for FlakyAuthority {
    fn name(&self) -> &str {
        "flaky-local"
    }

    fn challenge_kind(&self) -> ChallengeKind {
        self.inner.challenge_kind()
    }

    async fn submit(&self, request: &CertificateRequest) -> CertResult<Submission> {
        let remaining = self.submit_timeouts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.submit_timeouts.store(remaining - 1, Ordering::SeqCst);
            return Err(CertError::Timeout {
                operation: "submit".to_string(),
                elapsed: std::time::Duration::from_secs(30),
            });
        }
        self.inner.submit(request).await
    }

    async fn notify(&self, order: &OrderToken, challenge: &Challenge) -> CertResult<()> {
        self.inner.notify(order, challenge).await
    }

    async fn poll(&self, order: &OrderToken) -> CertResult<ValidationStatus> {
        self.inner.poll(order).await
    }

    async fn finalize(&self, order: &OrderToken, request: &CertificateRequest) -> CertResult<String> {
        let chain = self.inner.finalize(order, request).await?;
        self.issued.lock().push(chain.clone());
        Ok(chain)
    }

    async fn revoke(&self, chain_pem: &str) -> CertResult<()> {
        self.inner.revoke(chain_pem).await
    }

    fn release(&self, order: &OrderToken) {
        self.inner.release(order)
    }

    fn trust_anchors(&self) -> Vec<CertificateDer<'static>> {
        self.inner.trust_anchors()
    }
}

struct Env {
    _dir: TempDir,
    authority: Arc<FlakyAuthority>,
    manager: CertManager,
}

fn env(submit_timeouts: u32) -> Env {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.store.path = dir.path().to_path_buf();
    config.issuance.max_attempts = 4;
    config.issuance.backoff_initial_ms = 1;
    config.issuance.backoff_max_ms = 5;
    config.issuance.poll_interval_ms = 5;

    let store = Arc::new(CertStore::open_with_key(dir.path(), MasterKey::generate()).unwrap());
    let responder = ChallengeManager::new();
    let authority = Arc::new(FlakyAuthority::new(responder.clone(), submit_timeouts));
    let manager = CertManager::with_authority(
        config,
        store,
        Arc::clone(&authority) as Arc<dyn Authority>,
        Arc::new(responder.clone()),
        responder,
    )
    .unwrap();

    Env {
        _dir: dir,
        authority,
        manager,
    }
}

fn example_request() -> IssueRequest {
    IssueRequest {
        subject: "example.com".to_string(),
        sans: vec!["example.com".to_string(), "www.example.com".to_string()],
        key_algorithm: KeyAlgorithm::EcdsaP256,
        force: false,
    }
}

fn example() -> Identity {
    Identity::new("example.com").unwrap()
}

fn events(manager: &CertManager, identity: &Identity) -> Vec<AuditEvent> {
    manager
        .audit()
        .for_identity(identity)
        .unwrap()
        .into_iter()
        .map(|r| r.event)
        .collect()
}

#[tokio::test]
async fn test_issue_stores_certificate_with_requested_names() {
    let env = env(0);
    let outcome = env
        .manager
        .issue(example_request(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.changed());

    let stored = env.manager.store().require(&example()).unwrap();
    assert_eq!(stored.status, CertStatus::Active);
    assert_eq!(stored.info.sans, vec!["example.com", "www.example.com"]);
    assert_eq!(stored.key_algorithm, KeyAlgorithm::EcdsaP256);
    assert_eq!(events(&env.manager, &example()), vec![AuditEvent::Issued]);
}

#[tokio::test]
async fn test_timeouts_are_retried_then_issued() {
    let env = env(3);
    env.manager
        .issue(example_request(), &CancellationToken::new())
        .await
        .unwrap();

    let records = env.manager.audit().for_identity(&example()).unwrap();
    let events: Vec<AuditEvent> = records.iter().map(|r| r.event).collect();
    assert_eq!(
        events,
        vec![
            AuditEvent::Retry,
            AuditEvent::Retry,
            AuditEvent::Retry,
            AuditEvent::Issued
        ]
    );
    assert!(records[..3]
        .iter()
        .all(|r| r.error_kind == Some(ErrorKind::Timeout)));
    // Every attempt belongs to the same operation.
    assert!(records.iter().all(|r| r.operation == records[0].operation));
    assert!(env.manager.store().get(&example()).unwrap().is_some());
}

#[tokio::test]
async fn test_persistent_timeouts_reject_the_request() {
    let env = env(10);
    let err = env
        .manager
        .issue(example_request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.exit_code(), 2);
    assert_eq!(events(&env.manager, &example()).last(), Some(&AuditEvent::Rejected));
    assert!(env.manager.store().get(&example()).unwrap().is_none());
}

#[tokio::test]
async fn test_revoke_then_inspect_is_not_found() {
    let env = env(0);
    let cancel = CancellationToken::new();
    env.manager.issue(example_request(), &cancel).await.unwrap();

    env.manager.revoke(&example(), &cancel).await.unwrap();
    assert_eq!(env.authority.inner.revoked_serials().len(), 1);

    let err = env.manager.inspect(&example()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_ne!(err.exit_code(), 0);
}

#[tokio::test]
async fn test_reissue_without_changes_is_a_no_op() {
    let env = env(0);
    let cancel = CancellationToken::new();
    env.manager.issue(example_request(), &cancel).await.unwrap();

    // Same names in a different order.
    let mut request = example_request();
    request.sans.reverse();
    let outcome = env.manager.issue(request, &cancel).await.unwrap();
    assert!(!outcome.changed());
    assert_eq!(env.authority.issued.lock().len(), 1);

    let mut forced = example_request();
    forced.force = true;
    assert!(env.manager.issue(forced, &cancel).await.unwrap().changed());
    assert_eq!(env.authority.issued.lock().len(), 2);
}

#[tokio::test]
async fn test_store_round_trip_is_byte_identical() {
    let env = env(0);
    env.manager
        .issue(example_request(), &CancellationToken::new())
        .await
        .unwrap();

    let issued = env.authority.issued.lock()[0].clone();
    let stored = env.manager.store().require(&example()).unwrap();
    assert_eq!(stored.chain_pem.as_bytes(), issued.as_bytes());
    assert_eq!(stored.chain_len, 2);
}

#[tokio::test]
async fn test_renewal_threshold_boundary() {
    let env = env(0);
    env.manager
        .issue(example_request(), &CancellationToken::new())
        .await
        .unwrap();
    let info = env.manager.store().require(&example()).unwrap().info;

    let fraction = RenewalThreshold::RemainingFraction(1.0 / 3.0);
    let at = renew_at(&info, fraction);
    assert!(is_due(&info, fraction, at));
    assert!(!is_due(&info, fraction, at - Duration::seconds(1)));

    let window = RenewalThreshold::BeforeExpiry(std::time::Duration::from_secs(30 * 86400));
    let at = renew_at(&info, window);
    assert_eq!(at, info.not_after - Duration::days(30));
    assert!(is_due(&info, window, at));
    assert!(!is_due(&info, window, at - Duration::seconds(1)));
}

#[tokio::test]
async fn test_at_most_one_renewal_in_flight() {
    let tasks = Arc::new(TaskRegistry::new(RetryPolicy::default()));
    let now = chrono::Utc::now();
    let identity = example();
    assert!(tasks.enqueue(&identity, now).unwrap());

    let mut handles = Vec::new();
    for _ in 0..32 {
        let tasks = Arc::clone(&tasks);
        let identity = identity.clone();
        handles.push(tokio::spawn(async move {
            let queued = tasks.enqueue(&identity, now).unwrap();
            let claim = tasks.claim(&identity, now).unwrap();
            (queued, claim)
        }));
    }

    let mut claims = Vec::new();
    for handle in handles {
        let (queued, claim) = handle.await.unwrap();
        assert!(!queued);
        claims.extend(claim);
    }
    assert_eq!(claims.len(), 1);
    assert_eq!(tasks.in_flight(), 1);
    assert_eq!(tasks.get(&identity).unwrap().state, TaskState::InFlight);
}

#[test]
fn test_one_renewal_in_flight_across_store_handles() {
    let dir = TempDir::new().unwrap();
    let key = MasterKey::generate().to_base64();
    let registries: Vec<TaskRegistry> = (0..4)
        .map(|_| {
            let store = CertStore::open_with_key(dir.path(), MasterKey::from_base64(&key).unwrap())
                .unwrap();
            TaskRegistry::open(Arc::new(store), RetryPolicy::default()).unwrap()
        })
        .collect();
    let now = chrono::Utc::now();
    let identity = example();

    let claims = std::thread::scope(|s| {
        let handles: Vec<_> = registries
            .iter()
            .map(|tasks| {
                let identity = &identity;
                s.spawn(move || {
                    tasks.enqueue(identity, now).unwrap();
                    tasks.claim(identity, now).unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(claims.len(), 1);
    for tasks in &registries {
        tasks.refresh().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.get(&identity).unwrap().state, TaskState::InFlight);
    }
}

#[tokio::test]
async fn test_renew_due_replaces_certificate() {
    let env = env(0);
    let cancel = CancellationToken::new();
    env.manager.issue(example_request(), &cancel).await.unwrap();
    let before = env.manager.store().require(&example()).unwrap();

    // Nothing is due right after issuance.
    let report = env.manager.renew_due(&cancel).await.unwrap();
    assert!(report.renewed.is_empty());

    let renewed = env.manager.renew(&example(), &cancel).await.unwrap();
    assert_ne!(renewed.info.serial, before.info.serial);
    assert_eq!(renewed.previous_serial.as_deref(), Some(before.info.serial.as_str()));
    assert_eq!(
        events(&env.manager, &example()),
        vec![AuditEvent::Issued, AuditEvent::Renewed]
    );
}
