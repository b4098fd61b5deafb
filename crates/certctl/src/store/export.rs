//! Plain PEM export for servers that read certificates from disk.
//!
//! ```text
//! <out>/
//! └── example.com/
//!     ├── example.com.pem   # Leaf and intermediates, 0644
//!     └── example.com.key   # PKCS#8 private key, 0600
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use certctl_common::{CertError, CertResult, Identity};

use super::error::StoreError;
use super::{write_atomic, CertStatus, CertStore};
use crate::request::KeyId;

/// Files written by [`CertStore::export`].
#[derive(Debug, Clone, Serialize)]
pub struct ExportedFiles {
    pub identity: Identity,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub key_id: KeyId,
    pub serial: String,
    pub not_after: DateTime<Utc>,
}

impl CertStore {
    /// Write the active chain and its decrypted key under `out_dir`.
    ///
    /// Existing files are replaced atomically. Revoked certificates are not
    /// exported.
    pub fn export(&self, identity: &Identity, out_dir: &Path) -> CertResult<ExportedFiles> {
        let stored = self.require(identity)?;
        if stored.status == CertStatus::Revoked {
            return Err(CertError::PolicyViolation(format!(
                "certificate for {} is revoked and cannot be exported",
                identity
            )));
        }
        let key = self.load_key(identity)?;
        if key.key_id() != &stored.key_id {
            return Err(CertError::integrity(
                identity,
                "key changed while the certificate was read",
            ));
        }

        let name = identity.storage_key();
        let dir = out_dir.join(&name);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let cert_path = dir.join(format!("{}.pem", name));
        let key_path = dir.join(format!("{}.key", name));
        write_atomic(&cert_path, stored.chain_pem.as_bytes(), false)?;
        write_atomic(&key_path, key.serialize_pem().as_bytes(), true)?;

        info!(
            identity = %identity,
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Exported certificate"
        );

        Ok(ExportedFiles {
            identity: identity.clone(),
            cert_path,
            key_path,
            key_id: stored.key_id,
            serial: stored.info.serial,
            not_after: stored.info.not_after,
        })
    }
}
