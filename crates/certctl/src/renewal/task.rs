//! Renewal task table.
//!
//! One entry per identity that crossed its renewal threshold. The table is
//! keyed by identity, so enqueueing and claiming go through the map's entry
//! lock and at most one task per identity can be active or in flight.
//!
//! A registry opened on a store writes through to `renewal.json`. Every
//! change re-reads the file under the store's state lock first, so
//! processes sharing a store never overwrite each other's tasks. A claimed
//! task holds the identity's lease until it is settled; a task found in
//! flight on disk whose lease is free belonged to a process that died and
//! is pending again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use certctl_common::{CertError, CertResult, ErrorKind, Identity, RetryPolicy};

use crate::store::{CertStore, IdentityLease};

/// State file under the store root.
pub const TASKS_STATE: &str = "renewal.json";

const TASKS_VERSION: u32 = 1;

/// Renewal task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    InFlight,
    Succeeded,
    FailedRetry,
    FailedFatal,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Succeeded => "succeeded",
            Self::FailedRetry => "failed-retry",
            Self::FailedFatal => "failed-fatal",
        }
    }

    /// Pending, in flight or waiting for a retry.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InFlight | Self::FailedRetry)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalTask {
    pub identity: Identity,
    pub state: TaskState,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time a `failed-retry` task may run again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<TaskError>,
}

impl RenewalTask {
    fn new(identity: Identity, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            state: TaskState::Pending,
            consecutive_failures: 0,
            created_at: now,
            next_attempt_at: None,
            last_error: None,
        }
    }

    /// Whether the task may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            TaskState::Pending => true,
            TaskState::FailedRetry => self.next_attempt_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskTable {
    format_version: u32,
    tasks: Vec<RenewalTask>,
}

/// A task moved to in-flight, together with the identity's lease.
///
/// Settle it with [`TaskRegistry::complete`], [`TaskRegistry::fail`] or
/// [`TaskRegistry::release`]. Dropping it unsettled leaves the task in
/// flight until the next registry that loads the table recovers it.
#[derive(Debug)]
pub struct Claim {
    pub task: RenewalTask,
    lease: Option<IdentityLease>,
}

impl Claim {
    pub fn identity(&self) -> &Identity {
        &self.task.identity
    }

    /// Whether the claim holds a store lease (registries opened on a store).
    pub fn is_leased(&self) -> bool {
        self.lease.is_some()
    }
}

/// Concurrent task table shared by the scheduler and explicit renewals.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: DashMap<Identity, RenewalTask>,
    retry: RetryPolicy,
    store: Option<Arc<CertStore>>,
}

impl TaskRegistry {
    /// In-memory registry.
    ///
    /// `retry.max_attempts` is the number of consecutive failures after
    /// which a task turns fatal.
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            tasks: DashMap::new(),
            retry,
            store: None,
        }
    }

    /// Registry persisted in the store's `renewal.json`.
    pub fn open(store: Arc<CertStore>, retry: RetryPolicy) -> CertResult<Self> {
        let registry = Self {
            tasks: DashMap::new(),
            retry,
            store: Some(store),
        };
        registry.refresh()?;
        debug!(tasks = registry.tasks.len(), "Loaded renewal tasks");
        Ok(registry)
    }

    /// Pick up changes other processes made to the persisted table.
    pub fn refresh(&self) -> CertResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _lock = store.lock_state()?;
        self.sync_from_disk(store)
    }

    fn sync_from_disk(&self, store: &CertStore) -> CertResult<()> {
        let tasks = match store.read_state::<TaskTable>(TASKS_STATE)? {
            None => Vec::new(),
            Some(table) if table.format_version != TASKS_VERSION => {
                return Err(CertError::integrity(
                    TASKS_STATE,
                    format!(
                        "unsupported task table version {} (supported: {})",
                        table.format_version, TASKS_VERSION
                    ),
                ));
            }
            Some(table) => table.tasks,
        };

        let mut loaded = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            if task.state == TaskState::InFlight && !store.is_leased(&task.identity)? {
                warn!(identity = %task.identity, "Recovering interrupted renewal task");
                task.state = TaskState::Pending;
            }
            loaded.push(task);
        }

        self.tasks
            .retain(|identity, _| loaded.iter().any(|t| &t.identity == identity));
        for task in loaded {
            self.tasks.insert(task.identity.clone(), task);
        }
        Ok(())
    }

    /// Run `change` on the current table and persist the result.
    ///
    /// With a store, the state lock is held from the re-read to the write.
    /// Nothing is written when `change` fails.
    fn transact<T>(&self, change: impl FnOnce(&Self) -> CertResult<T>) -> CertResult<T> {
        let Some(store) = &self.store else {
            return change(self);
        };
        let _lock = store.lock_state()?;
        self.sync_from_disk(store)?;
        let result = change(self)?;
        let table = TaskTable {
            format_version: TASKS_VERSION,
            tasks: self.snapshot(),
        };
        store.write_state(TASKS_STATE, &table)?;
        Ok(result)
    }

    /// Create a pending task unless one already exists for the identity.
    ///
    /// Returns `true` if a task was created.
    pub fn enqueue(&self, identity: &Identity, now: DateTime<Utc>) -> CertResult<bool> {
        self.transact(|registry| {
            Ok(match registry.tasks.entry(identity.clone()) {
                Entry::Occupied(mut entry) => {
                    if entry.get().state == TaskState::Succeeded {
                        entry.insert(RenewalTask::new(identity.clone(), now));
                        true
                    } else {
                        false
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(RenewalTask::new(identity.clone(), now));
                    info!(identity = %identity, "Renewal task created");
                    true
                }
            })
        })
    }

    /// Move a ready task to in-flight. `None` if there is no ready task or
    /// another operation holds the identity's lease.
    pub fn claim(&self, identity: &Identity, now: DateTime<Utc>) -> CertResult<Option<Claim>> {
        self.transact(|registry| {
            let Some(mut task) = registry.tasks.get_mut(identity) else {
                return Ok(None);
            };
            if !task.is_ready(now) {
                return Ok(None);
            }
            let lease = match &registry.store {
                Some(store) => match store.try_lease(identity)? {
                    Some(lease) => Some(lease),
                    None => {
                        debug!(identity = %identity, "Identity is leased elsewhere, not claiming");
                        return Ok(None);
                    }
                },
                None => None,
            };
            task.state = TaskState::InFlight;
            Ok(Some(Claim {
                task: task.clone(),
                lease,
            }))
        })
    }

    /// Identities whose task can be claimed at `now`, sorted.
    pub fn ready(&self, now: DateTime<Utc>) -> Vec<Identity> {
        let mut ready: Vec<Identity> = self
            .tasks
            .iter()
            .filter(|t| t.is_ready(now))
            .map(|t| t.key().clone())
            .collect();
        ready.sort();
        ready
    }

    /// Renewal committed: the task is done and leaves the table.
    pub fn complete(&self, claim: Claim) -> CertResult<Option<RenewalTask>> {
        self.transact(|registry| {
            let Some((_, mut task)) = registry.tasks.remove(claim.identity()) else {
                return Ok(None);
            };
            task.state = TaskState::Succeeded;
            task.last_error = None;
            Ok(Some(task))
        })
    }

    /// Record a failed attempt of a claimed task.
    pub fn fail(
        &self,
        claim: Claim,
        error: &CertError,
        now: DateTime<Utc>,
    ) -> CertResult<Option<RenewalTask>> {
        self.transact(|registry| {
            let Some(mut task) = registry.tasks.get_mut(claim.identity()) else {
                return Ok(None);
            };
            task.consecutive_failures = task.consecutive_failures.saturating_add(1);
            task.last_error = Some(TaskError {
                kind: error.kind(),
                message: error.to_string(),
            });

            if task.consecutive_failures >= registry.retry.max_attempts {
                task.state = TaskState::FailedFatal;
                task.next_attempt_at = None;
            } else {
                let delay = registry.retry.delay_for_retry(task.consecutive_failures);
                let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
                task.state = TaskState::FailedRetry;
                task.next_attempt_at = Some(now.checked_add_signed(delay).unwrap_or(now));
            }
            Ok(Some(task.clone()))
        })
    }

    /// Put an interrupted task back without counting a failure.
    pub fn release(&self, claim: Claim) -> CertResult<()> {
        self.transact(|registry| {
            if let Some(mut task) = registry.tasks.get_mut(claim.identity()) {
                if task.state == TaskState::InFlight {
                    task.state = TaskState::Pending;
                }
            }
            Ok(())
        })
    }

    /// Operator reset: the identity gets a fresh pending task whatever its
    /// history. Fails if a renewal is currently in flight.
    pub fn reset(&self, identity: &Identity, now: DateTime<Utc>) -> CertResult<()> {
        self.transact(|registry| match registry.tasks.entry(identity.clone()) {
            Entry::Occupied(entry) if entry.get().state == TaskState::InFlight => {
                Err(CertError::InternalStore(format!(
                    "a renewal of {} is already in flight",
                    identity
                )))
            }
            Entry::Occupied(mut entry) => {
                if entry.get().state == TaskState::FailedFatal {
                    info!(identity = %identity, "Resetting fatal renewal task");
                }
                entry.insert(RenewalTask::new(identity.clone(), now));
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(RenewalTask::new(identity.clone(), now));
                Ok(())
            }
        })
    }

    pub fn remove(&self, identity: &Identity) -> CertResult<Option<RenewalTask>> {
        self.transact(|registry| Ok(registry.tasks.remove(identity).map(|(_, task)| task)))
    }

    pub fn get(&self, identity: &Identity) -> Option<RenewalTask> {
        self.tasks.get(identity).map(|t| t.clone())
    }

    /// All tasks, sorted by identity.
    pub fn snapshot(&self) -> Vec<RenewalTask> {
        let mut tasks: Vec<RenewalTask> = self.tasks.iter().map(|t| t.clone()).collect();
        tasks.sort_by(|a, b| a.identity.cmp(&b.identity));
        tasks
    }

    pub fn in_flight(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::InFlight)
            .count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MasterKey;
    use std::time::Duration;
    use tempfile::TempDir;

    fn policy(max_failures: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_failures,
            Duration::from_secs(60),
            Duration::from_secs(3600),
        )
    }

    fn registry(max_failures: u32) -> TaskRegistry {
        TaskRegistry::new(policy(max_failures))
    }

    fn id(name: &str) -> Identity {
        Identity::new(name).unwrap()
    }

    /// Two handles on one store directory, as two processes would have.
    fn shared_stores(dir: &TempDir) -> (Arc<CertStore>, Arc<CertStore>) {
        let encoded = MasterKey::generate().to_base64();
        let open = || {
            Arc::new(
                CertStore::open_with_key(dir.path(), MasterKey::from_base64(&encoded).unwrap())
                    .unwrap(),
            )
        };
        (open(), open())
    }

    #[test]
    fn test_enqueue_deduplicates() {
        let tasks = registry(3);
        let now = Utc::now();
        assert!(tasks.enqueue(&id("example.com"), now).unwrap());
        assert!(!tasks.enqueue(&id("example.com"), now).unwrap());
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let tasks = registry(3);
        let now = Utc::now();
        let identity = id("example.com");
        tasks.enqueue(&identity, now).unwrap();

        let claims = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    if let Some(claim) = tasks.claim(&identity, now).unwrap() {
                        claims.lock().unwrap().push(claim);
                    }
                });
            }
        });

        assert_eq!(claims.into_inner().unwrap().len(), 1);
        assert_eq!(tasks.in_flight(), 1);
        assert!(!tasks.enqueue(&identity, now).unwrap());
    }

    #[test]
    fn test_failures_back_off_then_turn_fatal() {
        let tasks = registry(3);
        let now = Utc::now();
        let identity = id("example.com");
        let error = CertError::AuthorityUnreachable("down".to_string());
        tasks.enqueue(&identity, now).unwrap();

        let claim = tasks.claim(&identity, now).unwrap().unwrap();
        let task = tasks.fail(claim, &error, now).unwrap().unwrap();
        assert_eq!(task.state, TaskState::FailedRetry);
        assert_eq!(task.next_attempt_at, Some(now + chrono::Duration::seconds(60)));
        assert!(tasks.claim(&identity, now).unwrap().is_none());

        let later = now + chrono::Duration::seconds(60);
        let claim = tasks.claim(&identity, later).unwrap().unwrap();
        let task = tasks.fail(claim, &error, later).unwrap().unwrap();
        assert_eq!(task.consecutive_failures, 2);
        assert_eq!(
            task.next_attempt_at,
            Some(later + chrono::Duration::seconds(120))
        );

        let much_later = later + chrono::Duration::hours(1);
        let claim = tasks.claim(&identity, much_later).unwrap().unwrap();
        let task = tasks.fail(claim, &error, much_later).unwrap().unwrap();
        assert_eq!(task.state, TaskState::FailedFatal);
        assert_eq!(task.last_error.unwrap().kind, ErrorKind::AuthorityUnreachable);

        // Fatal tasks are never picked up again on their own.
        let far = much_later + chrono::Duration::days(30);
        assert!(tasks.claim(&identity, far).unwrap().is_none());
        assert!(!tasks.enqueue(&identity, far).unwrap());
        assert!(tasks.ready(far).is_empty());
    }

    #[test]
    fn test_reset_revives_fatal_task() {
        let tasks = registry(1);
        let now = Utc::now();
        let identity = id("example.com");
        tasks.enqueue(&identity, now).unwrap();
        let claim = tasks.claim(&identity, now).unwrap().unwrap();
        tasks.fail(claim, &CertError::Cancelled, now).unwrap();
        assert_eq!(tasks.get(&identity).unwrap().state, TaskState::FailedFatal);

        tasks.reset(&identity, now).unwrap();
        let task = tasks.get(&identity).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.consecutive_failures, 0);

        let _claim = tasks.claim(&identity, now).unwrap().unwrap();
        assert!(tasks.reset(&identity, now).is_err());
    }

    #[test]
    fn test_complete_and_release() {
        let tasks = registry(3);
        let now = Utc::now();
        let identity = id("example.com");
        tasks.enqueue(&identity, now).unwrap();

        let claim = tasks.claim(&identity, now).unwrap().unwrap();
        assert!(!claim.is_leased());
        tasks.release(claim).unwrap();
        assert_eq!(tasks.get(&identity).unwrap().state, TaskState::Pending);
        assert_eq!(tasks.get(&identity).unwrap().consecutive_failures, 0);

        let claim = tasks.claim(&identity, now).unwrap().unwrap();
        let done = tasks.complete(claim).unwrap().unwrap();
        assert_eq!(done.state, TaskState::Succeeded);
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_changes_are_written_through() {
        let dir = TempDir::new().unwrap();
        let (store, _) = shared_stores(&dir);
        let now = Utc::now();

        let tasks = TaskRegistry::open(store.clone(), policy(3)).unwrap();
        tasks.enqueue(&id("a.example.com"), now).unwrap();
        tasks.enqueue(&id("b.example.com"), now).unwrap();

        let table: TaskTable = store.read_state(TASKS_STATE).unwrap().unwrap();
        assert_eq!(table.format_version, TASKS_VERSION);
        assert_eq!(table.tasks.len(), 2);

        tasks.remove(&id("a.example.com")).unwrap();
        let table: TaskTable = store.read_state(TASKS_STATE).unwrap().unwrap();
        assert_eq!(table.tasks.len(), 1);
    }

    #[test]
    fn test_crashed_claim_is_recovered() {
        let dir = TempDir::new().unwrap();
        let (store, _) = shared_stores(&dir);
        let now = Utc::now();

        let tasks = TaskRegistry::open(store.clone(), policy(3)).unwrap();
        tasks.enqueue(&id("a.example.com"), now).unwrap();
        tasks.enqueue(&id("b.example.com"), now).unwrap();
        let claim = tasks.claim(&id("b.example.com"), now).unwrap().unwrap();
        assert!(claim.is_leased());

        // The owner still holds the lease: the task stays in flight.
        let reopened = TaskRegistry::open(store.clone(), policy(3)).unwrap();
        assert_eq!(reopened.in_flight(), 1);
        assert_eq!(reopened.ready(now), vec![id("a.example.com")]);

        // The owner went away without settling the task.
        drop(claim);
        let recovered = TaskRegistry::open(store, policy(3)).unwrap();
        assert_eq!(recovered.in_flight(), 0);
        assert_eq!(
            recovered.get(&id("b.example.com")).unwrap().state,
            TaskState::Pending
        );
        assert_eq!(recovered.ready(now).len(), 2);
    }

    #[test]
    fn test_two_registries_never_claim_the_same_identity() {
        let dir = TempDir::new().unwrap();
        let (first_store, second_store) = shared_stores(&dir);
        let now = Utc::now();
        let identity = id("example.com");

        let first = TaskRegistry::open(first_store, policy(3)).unwrap();
        let second = TaskRegistry::open(second_store, policy(3)).unwrap();
        first.enqueue(&identity, now).unwrap();

        // The second registry sees the task but not as claimable once the
        // first has it in flight.
        let claim = first.claim(&identity, now).unwrap().unwrap();
        assert!(second.claim(&identity, now).unwrap().is_none());
        assert!(second.reset(&identity, now).is_err());
        assert!(!second.enqueue(&identity, now).unwrap());
        assert_eq!(second.get(&identity).unwrap().state, TaskState::InFlight);

        first.complete(claim).unwrap();
        second.refresh().unwrap();
        assert!(second.get(&identity).is_none());
        assert!(second.enqueue(&identity, now).unwrap());
        assert!(second.claim(&identity, now).unwrap().is_some());
    }

    #[test]
    fn test_registries_do_not_overwrite_each_other() {
        let dir = TempDir::new().unwrap();
        let (first_store, second_store) = shared_stores(&dir);
        let now = Utc::now();

        let first = TaskRegistry::open(first_store, policy(3)).unwrap();
        let second = TaskRegistry::open(second_store, policy(3)).unwrap();

        first.enqueue(&id("a.example.com"), now).unwrap();
        second.enqueue(&id("b.example.com"), now).unwrap();
        second.reset(&id("c.example.com"), now).unwrap();
        first.enqueue(&id("d.example.com"), now).unwrap();

        first.refresh().unwrap();
        let names: Vec<String> = first
            .snapshot()
            .iter()
            .map(|t| t.identity.to_string())
            .collect();
        assert_eq!(
            names,
            vec!["a.example.com", "b.example.com", "c.example.com", "d.example.com"]
        );
    }

    #[test]
    fn test_rejects_unknown_table_version() {
        let dir = TempDir::new().unwrap();
        let (store, _) = shared_stores(&dir);
        store
            .write_state(
                TASKS_STATE,
                &TaskTable {
                    format_version: TASKS_VERSION + 1,
                    tasks: Vec::new(),
                },
            )
            .unwrap();

        let err = TaskRegistry::open(store, policy(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IntegrityError);
    }
}
