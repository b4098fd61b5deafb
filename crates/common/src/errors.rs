//! certctl error taxonomy.
//!
//! Every failure surfaced by the engine maps onto one [`ErrorKind`]. The kind
//! decides the CLI exit code and whether the issuance engine or the renewal
//! scheduler may retry the failed step.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for certctl operations.
pub type CertResult<T> = Result<T, CertError>;

/// Stable error kinds, printed by the CLI and recorded in audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidSubject,
    UnsupportedAlgorithm,
    AuthorityUnreachable,
    ChallengeFailed,
    Timeout,
    IntegrityError,
    NotFound,
    PolicyViolation,
    Cancelled,
    InternalStoreError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSubject => "InvalidSubject",
            Self::UnsupportedAlgorithm => "UnsupportedAlgorithm",
            Self::AuthorityUnreachable => "AuthorityUnreachable",
            Self::ChallengeFailed => "ChallengeFailed",
            Self::Timeout => "Timeout",
            Self::IntegrityError => "IntegrityError",
            Self::NotFound => "NotFound",
            Self::PolicyViolation => "PolicyViolation",
            Self::Cancelled => "Cancelled",
            Self::InternalStoreError => "InternalStoreError",
        }
    }

    /// Process exit code for this kind.
    ///
    /// 1 validation, 2 network/authority, 3 internal/store.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidSubject | Self::UnsupportedAlgorithm | Self::PolicyViolation => 1,
            Self::AuthorityUnreachable | Self::ChallengeFailed | Self::Timeout | Self::Cancelled => {
                2
            }
            Self::IntegrityError | Self::NotFound | Self::InternalStoreError => 3,
        }
    }

    /// Transient kinds are retried with backoff; everything else propagates.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AuthorityUnreachable | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the certificate lifecycle pipeline.
#[derive(Debug, Clone, Error)]
pub enum CertError {
    #[error("invalid subject '{name}': {reason}")]
    InvalidSubject { name: String, reason: String },

    #[error("unsupported key algorithm '{algorithm}': {reason}")]
    UnsupportedAlgorithm { algorithm: String, reason: String },

    #[error("authority unreachable: {0}")]
    AuthorityUnreachable(String),

    #[error("challenge failed for '{identifier}': {reason}")]
    ChallengeFailed { identifier: String, reason: String },

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("integrity check failed for '{identity}': {reason}")]
    Integrity { identity: String, reason: String },

    #[error("no certificate stored for '{0}'")]
    NotFound(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal store error: {0}")]
    InternalStore(String),
}

impl CertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSubject { .. } => ErrorKind::InvalidSubject,
            Self::UnsupportedAlgorithm { .. } => ErrorKind::UnsupportedAlgorithm,
            Self::AuthorityUnreachable(_) => ErrorKind::AuthorityUnreachable,
            Self::ChallengeFailed { .. } => ErrorKind::ChallengeFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Integrity { .. } => ErrorKind::IntegrityError,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PolicyViolation(_) => ErrorKind::PolicyViolation,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InternalStore(_) => ErrorKind::InternalStoreError,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    pub fn integrity(identity: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Integrity {
            identity: identity.to_string(),
            reason: reason.into(),
        }
    }

    pub fn challenge_failed(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ChallengeFailed {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for CertError {
    fn from(e: std::io::Error) -> Self {
        Self::InternalStore(e.to_string())
    }
}

impl From<serde_json::Error> for CertError {
    fn from(e: serde_json::Error) -> Self {
        Self::InternalStore(format!("serialization error: {}", e))
    }
}
