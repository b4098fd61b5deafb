//! Durable key and certificate store.
//!
//! Keys and chains live in content-addressed objects; a per-identity
//! manifest points at the active pair. A commit writes the new objects
//! first and then atomically replaces the manifest, so readers observe
//! either the old certificate or the new one and never a mix.
//!
//! # Directory Structure
//!
//! ```text
//! store/
//! ├── store.json            # Format version, key encryption, master key fingerprint
//! ├── store.lock            # Guards renewal.json read-modify-write
//! ├── master.key            # Master key, unless supplied through the environment
//! ├── renewal.json          # Renewal task snapshot
//! ├── audit.log             # Append-only audit trail
//! ├── authority/            # Authority account state (sealed)
//! ├── locks/
//! │   ├── example.com.lease # Held while an identity is issued, renewed or revoked
//! │   └── example.com.write # Held while an identity's files change
//! ├── objects/
//! │   └── <sha256>          # Chain PEM or sealed key, named by digest
//! └── identities/
//!     └── example.com/
//!         ├── manifest.json # Active and previous record
//!         └── staged.json   # Key written ahead of its certificate
//! ```

pub mod error;
mod export;
mod lock;
mod manifest;
mod seal;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use certctl_common::{CertError, CertResult, Identity, KeyAlgorithm};

use crate::certinfo::{parse_chain, CertInfo};
use crate::policy::verify_chain_structure;
use crate::request::{KeyId, KeyPair};

pub use error::StoreError;
pub use export::ExportedFiles;
pub use lock::{FileLock, IdentityLease};
pub use manifest::{CertStatus, FORMAT_VERSION};
pub use seal::{KeySource, MasterKey, SealedKey, KEY_ENCRYPTION};

use manifest::{check_version, Manifest, Record, Staged, StoreMeta};

const STORE_META: &str = "store.json";
const OBJECTS: &str = "objects";
const IDENTITIES: &str = "identities";
const AUTHORITY: &str = "authority";
const LOCKS: &str = "locks";
const STATE_LOCK: &str = "store.lock";
const MANIFEST: &str = "manifest.json";
const STAGED: &str = "staged.json";
const AUDIT_LOG: &str = "audit.log";

/// Reads racing a commit re-read the manifest at most this many times.
const READ_ATTEMPTS: usize = 3;

/// A validated chain as returned by an authority.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM bundle, leaf first. Stored byte for byte.
    pub chain_pem: String,
    pub leaf: CertInfo,
}

impl IssuedCertificate {
    pub fn from_pem(chain_pem: impl Into<String>) -> CertResult<Self> {
        let chain_pem = chain_pem.into();
        let chain = parse_chain(&chain_pem).map_err(CertError::PolicyViolation)?;
        let leaf = CertInfo::from_der(&chain[0]).map_err(CertError::PolicyViolation)?;
        Ok(Self { chain_pem, leaf })
    }
}

/// What can be written to the store.
#[derive(Debug)]
pub enum Material {
    /// A freshly generated key, staged until its certificate arrives.
    Key(KeyPair),
    /// A certificate for the staged (or currently active) key.
    Certificate(IssuedCertificate),
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handle {
    pub identity: Identity,
    pub key_id: KeyId,
    /// Manifest generation after the write.
    pub generation: u64,
}

/// A committed certificate as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub identity: Identity,
    pub chain_pem: String,
    pub chain_len: usize,
    pub info: CertInfo,
    pub key_algorithm: KeyAlgorithm,
    pub key_id: KeyId,
    pub status: CertStatus,
    pub committed_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub generation: u64,
    /// Serial of the certificate this one replaced, if still retained.
    pub previous_serial: Option<String>,
}

/// Filesystem-backed store.
///
/// Writers to one identity are serialized by a per-identity lock, in memory
/// and on disk so other processes sharing the store wait too. Readers take
/// no lock and retry when a concurrent commit moved the manifest.
pub struct CertStore {
    root: PathBuf,
    master: MasterKey,
    locks: DashMap<Identity, Arc<Mutex<()>>>,
}

impl CertStore {
    /// Open (or create) a store, resolving the master key from `key_env`
    /// or `master.key`.
    pub fn open(root: &Path, key_env: &str) -> CertResult<Self> {
        create_private_dir(root)?;
        let (master, source) = MasterKey::load_or_create(root, key_env)?;
        debug!(source = ?source, "Resolved store master key");
        Ok(Self::init(root, master)?)
    }

    /// Open a store with an explicit master key.
    pub fn open_with_key(root: &Path, master: MasterKey) -> CertResult<Self> {
        create_private_dir(root)?;
        Ok(Self::init(root, master)?)
    }

    fn init(root: &Path, master: MasterKey) -> Result<Self, StoreError> {
        for dir in [OBJECTS, IDENTITIES, AUTHORITY, LOCKS] {
            create_private_dir(&root.join(dir))?;
        }

        let meta_path = root.join(STORE_META);
        match read_json_opt::<StoreMeta>(&meta_path, "store")? {
            Some(meta) => {
                check_version("store", meta.format_version)?;
                if meta.key_encryption != KEY_ENCRYPTION {
                    return Err(StoreError::corrupted(
                        "store",
                        format!("unsupported key encryption '{}'", meta.key_encryption),
                    ));
                }
                if meta.key_fingerprint != master.fingerprint() {
                    return Err(StoreError::corrupted(
                        "store",
                        "master key does not match the key this store was created with",
                    ));
                }
            }
            None => {
                let meta = StoreMeta {
                    format_version: FORMAT_VERSION,
                    key_encryption: KEY_ENCRYPTION.to_string(),
                    key_fingerprint: master.fingerprint(),
                    created_at: Utc::now(),
                };
                write_json(&meta_path, &meta, false)?;
            }
        }

        info!(
            store_path = %root.display(),
            format_version = FORMAT_VERSION,
            "Opened certificate store"
        );

        Ok(Self {
            root: root.to_path_buf(),
            master,
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for authority account state.
    pub fn authority_dir(&self) -> PathBuf {
        self.root.join(AUTHORITY)
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root.join(AUDIT_LOG)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write key or certificate material for an identity.
    ///
    /// A certificate is only accepted when the staged key (or the active
    /// key, for a re-issue under the same key) certifies it.
    pub fn put(&self, identity: &Identity, material: Material) -> CertResult<Handle> {
        let lock = self.lock_for(identity);
        let _guard = lock.lock();
        let _file = self.write_lock(identity)?;

        let handle = match material {
            Material::Key(key) => self.stage_key(identity, &key)?,
            Material::Certificate(cert) => self.commit_certificate(identity, &cert)?,
        };
        Ok(handle)
    }

    fn stage_key(&self, identity: &Identity, key: &KeyPair) -> Result<Handle, StoreError> {
        let dir = self.identity_dir(identity);
        create_private_dir(&dir)?;

        let sealed = self
            .master
            .seal(key.serialize_pem().as_bytes(), key.key_id().as_str())?;
        let key_object = self.write_object(&serde_json::to_vec(&sealed)?)?;

        let replaced = self.read_staged(identity)?;
        let staged = Staged {
            format_version: FORMAT_VERSION,
            identity: identity.clone(),
            key_id: key.key_id().clone(),
            key_algorithm: key.algorithm(),
            key_object: key_object.clone(),
            staged_at: Utc::now(),
        };
        write_json(&dir.join(STAGED), &staged, true)?;

        let manifest = self.read_manifest(identity)?;
        if let Some(old) = replaced {
            if old.key_object != key_object
                && !manifest.as_ref().is_some_and(|m| m.references(&old.key_object))
            {
                self.remove_object(&old.key_object);
            }
        }

        debug!(
            identity = %identity,
            key_id = key.key_id().short(),
            algorithm = %key.algorithm(),
            "Staged key"
        );

        Ok(Handle {
            identity: identity.clone(),
            key_id: key.key_id().clone(),
            generation: manifest.map_or(0, |m| m.generation),
        })
    }

    fn commit_certificate(
        &self,
        identity: &Identity,
        cert: &IssuedCertificate,
    ) -> Result<Handle, StoreError> {
        let chain = parse_chain(&cert.chain_pem).map_err(|e| StoreError::corrupted(identity, e))?;
        verify_chain_structure(&chain).map_err(|e| {
            StoreError::corrupted(identity, format!("chain is not well-formed: {}", e))
        })?;

        let key_id = &cert.leaf.key_id;
        let current = self.read_manifest(identity)?;
        let staged = self.read_staged(identity)?;

        let (key_object, key_algorithm, from_staged) = match (&staged, &current) {
            (Some(s), _) if &s.key_id == key_id => (s.key_object.clone(), s.key_algorithm, true),
            (_, Some(m)) if &m.active.key_id == key_id => {
                (m.active.key_object.clone(), m.active.key_algorithm, false)
            }
            _ => {
                return Err(StoreError::NoStagedKey {
                    identity: identity.to_string(),
                    key_id: key_id.to_string(),
                })
            }
        };

        let chain_object = self.write_object(cert.chain_pem.as_bytes())?;
        let record = Record {
            chain_object,
            key_object,
            key_id: key_id.clone(),
            key_algorithm,
            info: cert.leaf.clone(),
            status: CertStatus::Active,
            committed_at: Utc::now(),
            revoked_at: None,
        };

        let (generation, previous) = match &current {
            Some(m) => (m.generation + 1, Some(m.active.clone())),
            None => (1, None),
        };
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            identity: identity.clone(),
            generation,
            active: record,
            previous,
        };

        let dir = self.identity_dir(identity);
        create_private_dir(&dir)?;
        write_json(&dir.join(MANIFEST), &manifest, true)?;

        if from_staged {
            remove_if_exists(&dir.join(STAGED))?;
        }
        if let Some(displaced) = current.and_then(|m| m.previous) {
            for digest in displaced.objects() {
                if !manifest.references(digest) {
                    self.remove_object(digest);
                }
            }
        }

        info!(
            identity = %identity,
            generation,
            serial = %cert.leaf.serial,
            not_after = %cert.leaf.not_after,
            "Committed certificate"
        );

        Ok(Handle {
            identity: identity.clone(),
            key_id: key_id.clone(),
            generation,
        })
    }

    /// Flag the active certificate as revoked without removing it.
    pub fn mark_revoked(&self, identity: &Identity) -> CertResult<StoredCertificate> {
        {
            let lock = self.lock_for(identity);
            let _guard = lock.lock();
            let _file = self.write_lock(identity)?;

            let mut manifest = self
                .read_manifest(identity)?
                .ok_or_else(|| CertError::NotFound(identity.to_string()))?;
            manifest.active.status = CertStatus::Revoked;
            manifest.active.revoked_at = Some(Utc::now());
            manifest.generation += 1;
            write_json(&self.identity_dir(identity).join(MANIFEST), &manifest, true)?;
        }
        self.require(identity)
    }

    /// Remove an identity and every object it references.
    ///
    /// Returns `false` if there was no committed certificate.
    pub fn delete(&self, identity: &Identity) -> CertResult<bool> {
        let lock = self.lock_for(identity);
        let _guard = lock.lock();
        let _file = self.write_lock(identity)?;

        let dir = self.identity_dir(identity);
        if !dir.exists() {
            return Ok(false);
        }

        let manifest = self.read_manifest(identity)?;
        let staged = self.read_staged(identity)?;

        // Readers must see "not found" before objects disappear.
        remove_if_exists(&dir.join(MANIFEST))?;
        fs::remove_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let mut digests: Vec<String> = Vec::new();
        if let Some(m) = &manifest {
            digests.extend(m.active.objects().iter().map(|d| d.to_string()));
            if let Some(p) = &m.previous {
                digests.extend(p.objects().iter().map(|d| d.to_string()));
            }
        }
        if let Some(s) = staged {
            digests.push(s.key_object);
        }
        digests.sort();
        digests.dedup();
        for digest in &digests {
            self.remove_object(digest);
        }

        info!(identity = %identity, objects = digests.len(), "Deleted identity from store");
        Ok(manifest.is_some())
    }

    /// Drop a staged key that never received a certificate.
    pub fn discard_staged(&self, identity: &Identity) -> CertResult<bool> {
        let lock = self.lock_for(identity);
        let _guard = lock.lock();
        let _file = self.write_lock(identity)?;

        let Some(staged) = self.read_staged(identity)? else {
            return Ok(false);
        };
        remove_if_exists(&self.identity_dir(identity).join(STAGED))?;

        let manifest = self.read_manifest(identity)?;
        if !manifest
            .as_ref()
            .is_some_and(|m| m.references(&staged.key_object))
        {
            self.remove_object(&staged.key_object);
        }
        if manifest.is_none() {
            let _ = fs::remove_dir(self.identity_dir(identity));
        }

        debug!(identity = %identity, key_id = staged.key_id.short(), "Discarded staged key");
        Ok(true)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the active certificate of an identity.
    ///
    /// The chain is checked against its digest and structurally verified;
    /// any mismatch is an integrity error.
    pub fn get(&self, identity: &Identity) -> CertResult<Option<StoredCertificate>> {
        let Some(mut manifest) = self.read_manifest(identity)? else {
            return Ok(None);
        };

        let mut attempt = 1;
        loop {
            match self.load_record(identity, &manifest) {
                Ok(cert) => return Ok(Some(cert)),
                Err(e @ StoreError::MissingObject { .. }) if attempt < READ_ATTEMPTS => {
                    // A commit may have collected objects of the manifest we read.
                    match self.read_manifest(identity)? {
                        Some(latest) if latest.generation != manifest.generation => {
                            trace!(identity = %identity, "Manifest moved during read, retrying");
                            manifest = latest;
                            attempt += 1;
                        }
                        Some(_) => return Err(e.into()),
                        None => return Ok(None),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Like [`CertStore::get`], with absence as [`CertError::NotFound`].
    pub fn require(&self, identity: &Identity) -> CertResult<StoredCertificate> {
        self.get(identity)?
            .ok_or_else(|| CertError::NotFound(identity.to_string()))
    }

    fn load_record(
        &self,
        identity: &Identity,
        manifest: &Manifest,
    ) -> Result<StoredCertificate, StoreError> {
        let record = &manifest.active;
        let bytes = self.read_object(identity, &record.chain_object)?;
        let chain_pem = String::from_utf8(bytes)
            .map_err(|_| StoreError::corrupted(identity, "certificate chain is not UTF-8"))?;

        let chain = parse_chain(&chain_pem).map_err(|e| StoreError::corrupted(identity, e))?;
        verify_chain_structure(&chain).map_err(|e| {
            StoreError::corrupted(identity, format!("stored chain failed verification: {}", e))
        })?;
        let info = CertInfo::from_der(&chain[0]).map_err(|e| StoreError::corrupted(identity, e))?;
        if info.key_id != record.key_id {
            return Err(StoreError::corrupted(
                identity,
                "stored certificate does not certify the stored key",
            ));
        }
        if !self.object_path(&record.key_object).exists() {
            return Err(StoreError::MissingObject {
                identity: identity.to_string(),
                digest: record.key_object.clone(),
            });
        }

        Ok(StoredCertificate {
            identity: identity.clone(),
            chain_pem,
            chain_len: chain.len(),
            info,
            key_algorithm: record.key_algorithm,
            key_id: record.key_id.clone(),
            status: record.status,
            committed_at: record.committed_at,
            revoked_at: record.revoked_at,
            generation: manifest.generation,
            previous_serial: manifest.previous.as_ref().map(|p| p.info.serial.clone()),
        })
    }

    /// Decrypt the private key of the active certificate.
    pub fn load_key(&self, identity: &Identity) -> CertResult<KeyPair> {
        let manifest = self
            .read_manifest(identity)?
            .ok_or_else(|| CertError::NotFound(identity.to_string()))?;
        let record = &manifest.active;

        let bytes = self.read_object(identity, &record.key_object)?;
        let sealed: SealedKey = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::corrupted(identity, format!("unreadable key envelope: {}", e))
        })?;
        let pem = self
            .master
            .unseal(&sealed, record.key_id.as_str())
            .map_err(|e| match e {
                StoreError::Corrupted { reason, .. } => StoreError::corrupted(identity, reason),
                other => other,
            })?;
        let pem = String::from_utf8(pem)
            .map_err(|_| StoreError::corrupted(identity, "decrypted key is not UTF-8"))?;

        let key = KeyPair::from_pem(&pem)?;
        if key.key_id() != &record.key_id {
            return Err(CertError::integrity(identity, "decrypted key does not match its id"));
        }
        Ok(key)
    }

    /// Every identity with a committed certificate, sorted.
    pub fn identities(&self) -> CertResult<Vec<Identity>> {
        let dir = self.root.join(IDENTITIES);
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let mut identities = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match read_json_opt::<Manifest>(&path.join(MANIFEST), "manifest") {
                Ok(Some(manifest)) => identities.push(manifest.identity),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable manifest"),
            }
        }
        identities.sort();
        Ok(identities)
    }

    /// Every readable certificate. Unreadable entries are logged and skipped.
    pub fn list(&self) -> CertResult<Vec<StoredCertificate>> {
        let mut certs = Vec::new();
        for identity in self.identities()? {
            match self.get(&identity) {
                Ok(Some(cert)) => certs.push(cert),
                Ok(None) => {}
                Err(e) => warn!(identity = %identity, error = %e, "Skipping unreadable certificate"),
            }
        }
        Ok(certs)
    }

    // =========================================================================
    // Auxiliary state
    // =========================================================================

    /// Read a JSON document from the store root.
    pub fn read_state<T: DeserializeOwned>(&self, name: &str) -> CertResult<Option<T>> {
        Ok(read_json_opt(&self.root.join(name), name)?)
    }

    /// Atomically replace a JSON document in the store root.
    pub fn write_state<T: Serialize>(&self, name: &str, value: &T) -> CertResult<()> {
        Ok(write_json(&self.root.join(name), value, true)?)
    }

    /// Seal a secret under the master key into the authority directory.
    pub fn write_secret(&self, name: &str, plaintext: &[u8]) -> CertResult<()> {
        let sealed = self.master.seal(plaintext, name)?;
        let path = self.authority_dir().join(format!("{}.sealed", name));
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }
        write_json(&path, &sealed, true)?;
        debug!(name, "Stored sealed secret");
        Ok(())
    }

    pub fn read_secret(&self, name: &str) -> CertResult<Option<Vec<u8>>> {
        let path = self.authority_dir().join(format!("{}.sealed", name));
        let Some(sealed) = read_json_opt::<SealedKey>(&path, name)? else {
            return Ok(None);
        };
        Ok(Some(self.master.unseal(&sealed, name)?))
    }

    // =========================================================================
    // Cross-process coordination
    // =========================================================================

    /// Take the identity's lease unless another operation holds it.
    pub fn try_lease(&self, identity: &Identity) -> CertResult<Option<IdentityLease>> {
        let lock = FileLock::try_exclusive(&self.lock_path(identity, "lease"))?;
        Ok(lock.map(|lock| IdentityLease::new(identity.clone(), lock)))
    }

    /// Take the identity's lease, failing if another operation holds it.
    pub fn lease(&self, identity: &Identity) -> CertResult<IdentityLease> {
        self.try_lease(identity)?.ok_or_else(|| {
            CertError::InternalStore(format!(
                "{} is being issued, renewed or revoked by another operation",
                identity
            ))
        })
    }

    /// Whether some operation, in this process or another, holds the lease.
    pub fn is_leased(&self, identity: &Identity) -> CertResult<bool> {
        Ok(FileLock::try_exclusive(&self.lock_path(identity, "lease"))?.is_none())
    }

    /// Exclusive lock for read-modify-write of the store's state documents.
    /// Blocks until every other holder is done.
    pub fn lock_state(&self) -> CertResult<FileLock> {
        Ok(FileLock::exclusive(&self.root.join(STATE_LOCK))?)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lock_for(&self, identity: &Identity) -> Arc<Mutex<()>> {
        self.locks
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn write_lock(&self, identity: &Identity) -> Result<FileLock, StoreError> {
        FileLock::exclusive(&self.lock_path(identity, "write"))
    }

    fn lock_path(&self, identity: &Identity, kind: &str) -> PathBuf {
        self.root
            .join(LOCKS)
            .join(format!("{}.{}", identity.storage_key(), kind))
    }

    fn identity_dir(&self, identity: &Identity) -> PathBuf {
        self.root.join(IDENTITIES).join(identity.storage_key())
    }

    fn object_path(&self, digest: &str) -> PathBuf {
        self.root.join(OBJECTS).join(digest)
    }

    fn read_manifest(&self, identity: &Identity) -> Result<Option<Manifest>, StoreError> {
        let path = self.identity_dir(identity).join(MANIFEST);
        let Some(manifest) = read_json_opt::<Manifest>(&path, identity.as_str())? else {
            return Ok(None);
        };
        check_version("manifest", manifest.format_version)?;
        if &manifest.identity != identity {
            return Err(StoreError::corrupted(
                identity,
                format!("manifest belongs to '{}'", manifest.identity),
            ));
        }
        Ok(Some(manifest))
    }

    fn read_staged(&self, identity: &Identity) -> Result<Option<Staged>, StoreError> {
        let path = self.identity_dir(identity).join(STAGED);
        let staged = read_json_opt::<Staged>(&path, identity.as_str())?;
        if let Some(s) = &staged {
            check_version("staged key", s.format_version)?;
        }
        Ok(staged)
    }

    fn write_object(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let digest = hex::encode(Sha256::digest(bytes));
        let path = self.object_path(&digest);
        if !path.exists() {
            write_atomic(&path, bytes, true)?;
            trace!(digest = %&digest[..16], size = bytes.len(), "Wrote object");
        }
        Ok(digest)
    }

    fn read_object(&self, identity: &Identity, digest: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(digest);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::MissingObject {
                    identity: identity.to_string(),
                    digest: digest.to_string(),
                })
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        if hex::encode(Sha256::digest(&bytes)) != digest {
            return Err(StoreError::corrupted(
                identity,
                format!("object {} failed its digest check", digest),
            ));
        }
        Ok(bytes)
    }

    fn remove_object(&self, digest: &str) {
        let path = self.object_path(digest);
        if let Err(e) = remove_if_exists(&path) {
            warn!(digest, error = %e, "Failed to remove unreferenced object");
        }
    }
}

impl std::fmt::Debug for CertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertStore")
            .field("root", &self.root)
            .field("master", &self.master)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Filesystem helpers
// =============================================================================

/// Write `data` to a temporary sibling, sync it and rename it over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8], private: bool) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("object");
    let tmp = dir.join(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));

    let result = (|| -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if private { 0o600 } else { 0o644 };
            file.set_permissions(fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = private;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        sync_dir(dir)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T, private: bool) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &content, private)
}

fn read_json_opt<T: DeserializeOwned>(path: &Path, owner: &str) -> Result<Option<T>, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let value = serde_json::from_str(&content).map_err(|e| {
        StoreError::corrupted(owner, format!("unreadable {}: {}", path.display(), e))
    })?;
    Ok(Some(value))
}

fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn create_private_dir(path: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(path).map_err(|e| StoreError::io(path, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))
            .map_err(|e| StoreError::io(path, e))?;
    }
    Ok(())
}
