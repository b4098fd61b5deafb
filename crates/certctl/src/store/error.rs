//! Store error types.

use std::path::PathBuf;

use thiserror::Error;

use certctl_common::CertError;

/// Errors raised by the key and certificate store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid store data: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{what} format version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        what: &'static str,
        found: u32,
        supported: u32,
    },

    #[error("master key error: {0}")]
    MasterKey(String),

    #[error("'{identity}': {reason}")]
    Corrupted { identity: String, reason: String },

    #[error("object {digest} referenced by '{identity}' is missing")]
    MissingObject { identity: String, digest: String },

    #[error("no staged key for '{identity}' matches certificate key {key_id}")]
    NoStagedKey { identity: String, key_id: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupted(identity: impl ToString, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            identity: identity.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for CertError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupted { identity, reason } => CertError::Integrity { identity, reason },
            StoreError::MissingObject { identity, digest } => CertError::Integrity {
                identity,
                reason: format!("object {} is missing", digest),
            },
            other => CertError::InternalStore(other.to_string()),
        }
    }
}
