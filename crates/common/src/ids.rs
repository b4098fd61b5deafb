//! Type-safe identifier newtypes for certctl.
//!
//! These types provide compile-time safety for identifiers, preventing
//! accidental mixing of a certificate identity with an operation id or
//! a raw hostname string.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::CertError;

/// Certificate identity.
///
/// The normalized subject name a certificate is issued for. The identity
/// keys everything in the store: the active certificate, its key, the
/// renewal task and the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Create an identity from a subject name.
    ///
    /// The name is trimmed, lowercased and stripped of a trailing dot.
    /// Names that could escape a storage directory are rejected; full DNS
    /// syntax checks belong to the policy layer.
    pub fn new(name: impl AsRef<str>) -> Result<Self, CertError> {
        let normalized = name
            .as_ref()
            .trim()
            .trim_end_matches('.')
            .to_ascii_lowercase();

        let invalid = |reason: &str| CertError::InvalidSubject {
            name: name.as_ref().to_string(),
            reason: reason.to_string(),
        };

        if normalized.is_empty() {
            return Err(invalid("identity must not be empty"));
        }
        if normalized.starts_with('.') || normalized.contains("..") {
            return Err(invalid("identity must not contain empty labels"));
        }
        if normalized
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control() || c.is_whitespace())
        {
            return Err(invalid("identity contains characters not allowed in a name"));
        }

        Ok(Self(normalized))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory-safe form of the identity.
    ///
    /// A leading wildcard label is spelled out so the name never contains `*`.
    pub fn storage_key(&self) -> String {
        match self.0.strip_prefix("*.") {
            Some(rest) => format!("_wildcard.{}", rest),
            None => self.0.clone(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = CertError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

/// Unique id of a lifecycle operation (issue, renew, revoke).
///
/// Operation ids tie together the log lines and audit records produced by
/// a single pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    /// Create a new random operation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
