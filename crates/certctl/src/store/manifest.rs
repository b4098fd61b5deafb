//! On-disk records of the store.
//!
//! Every JSON document carries a `format_version`. Readers refuse documents
//! written by a newer version instead of guessing at their layout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use certctl_common::{Identity, KeyAlgorithm};

use super::error::StoreError;
use crate::certinfo::CertInfo;
use crate::request::KeyId;

/// Current layout version of `store.json`, manifests and staged keys.
pub const FORMAT_VERSION: u32 = 1;

/// Store-wide metadata, `store.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub format_version: u32,
    pub key_encryption: String,
    /// Fingerprint of the master key the store was created with.
    pub key_fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of a committed certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Active,
    Revoked,
}

impl CertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for CertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed certificate together with the key it certifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Digest of the chain PEM object.
    pub chain_object: String,
    /// Digest of the sealed key object.
    pub key_object: String,
    pub key_id: KeyId,
    pub key_algorithm: KeyAlgorithm,
    /// Leaf summary, duplicated here so listings don't parse every chain.
    pub info: CertInfo,
    pub status: CertStatus,
    pub committed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn objects(&self) -> [&str; 2] {
        [&self.chain_object, &self.key_object]
    }
}

/// Per-identity pointer to the active record, `identities/<id>/manifest.json`.
///
/// Replacing this file is the commit point of a certificate write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub identity: Identity,
    /// Incremented on every change.
    pub generation: u64,
    pub active: Record,
    /// The record displaced by the last commit, kept for one generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Record>,
}

impl Manifest {
    pub fn references(&self, digest: &str) -> bool {
        self.active.objects().contains(&digest)
            || self
                .previous
                .as_ref()
                .is_some_and(|p| p.objects().contains(&digest))
    }
}

/// A key written ahead of its certificate, `identities/<id>/staged.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Staged {
    pub format_version: u32,
    pub identity: Identity,
    pub key_id: KeyId,
    pub key_algorithm: KeyAlgorithm,
    pub key_object: String,
    pub staged_at: DateTime<Utc>,
}

pub(crate) fn check_version(what: &'static str, found: u32) -> Result<(), StoreError> {
    if found > FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            what,
            found,
            supported: FORMAT_VERSION,
        });
    }
    Ok(())
}
