//! HTTP-01 challenge solvers.
//!
//! [`ChallengeManager`] keeps token to key-authorization mappings in memory
//! for an in-process responder; [`WebrootSolver`] writes them where an
//! existing web server serves `/.well-known/acme-challenge/<token>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use certctl_common::{CertError, CertResult, ChallengeKind};

use super::authority::Challenge;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Something that can put a challenge response in place and remove it.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn kind(&self) -> ChallengeKind;

    /// Publish the response. Returns once the response is observable.
    async fn present(&self, challenge: &Challenge) -> CertResult<()>;

    /// Withdraw the response. Failures are logged by the caller.
    async fn cleanup(&self, challenge: &Challenge) -> CertResult<()>;
}

/// Pending HTTP-01 challenges.
///
/// Clones share the same table, so a responder and the issuance engine can
/// each hold one.
#[derive(Debug)]
pub struct ChallengeManager {
    /// Map of challenge token -> key authorization response
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self {
            challenges: Arc::new(DashMap::new()),
        }
    }

    /// Register a pending challenge
    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Remove a completed or expired challenge
    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed HTTP-01 challenge");
        }
    }

    /// Key authorization for a token, as a responder would serve it.
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "HTTP-01 challenge lookup");
        result
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}

impl Default for ChallengeManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ChallengeManager {
    fn clone(&self) -> Self {
        Self {
            challenges: Arc::clone(&self.challenges),
        }
    }
}

#[async_trait]
impl ChallengeSolver for ChallengeManager {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn present(&self, challenge: &Challenge) -> CertResult<()> {
        check_token(challenge)?;
        self.add_challenge(&challenge.token, &challenge.key_authorization);
        Ok(())
    }

    async fn cleanup(&self, challenge: &Challenge) -> CertResult<()> {
        self.remove_challenge(&challenge.token);
        Ok(())
    }
}

/// Writes challenge responses into a web server's document root.
#[derive(Debug, Clone)]
pub struct WebrootSolver {
    webroot: PathBuf,
}

impl WebrootSolver {
    pub fn new(webroot: impl Into<PathBuf>) -> Self {
        Self {
            webroot: webroot.into(),
        }
    }

    pub fn webroot(&self) -> &Path {
        &self.webroot
    }

    fn challenge_path(&self, token: &str) -> PathBuf {
        self.webroot
            .join(ACME_CHALLENGE_PREFIX.trim_start_matches('/'))
            .join(token)
    }
}

#[async_trait]
impl ChallengeSolver for WebrootSolver {
    fn kind(&self) -> ChallengeKind {
        ChallengeKind::Http01
    }

    async fn present(&self, challenge: &Challenge) -> CertResult<()> {
        check_token(challenge)?;
        let path = self.challenge_path(&challenge.token);
        let write_failed = |e: std::io::Error| {
            CertError::challenge_failed(
                &challenge.identifier,
                format!("cannot write {}: {}", path.display(), e),
            )
        };

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(write_failed)?;
        }
        tokio::fs::write(&path, challenge.key_authorization.as_bytes())
            .await
            .map_err(write_failed)?;

        debug!(
            identifier = %challenge.identifier,
            path = %path.display(),
            "Wrote HTTP-01 challenge file"
        );
        Ok(())
    }

    async fn cleanup(&self, challenge: &Challenge) -> CertResult<()> {
        let path = self.challenge_path(&challenge.token);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove challenge file");
                Err(CertError::challenge_failed(&challenge.identifier, e.to_string()))
            }
        }
    }
}

/// Tokens are base64url; anything else could escape the challenge directory.
fn check_token(challenge: &Challenge) -> CertResult<()> {
    let valid = !challenge.token.is_empty()
        && challenge
            .token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(CertError::challenge_failed(
            &challenge.identifier,
            "authority sent a malformed challenge token",
        ));
    }
    Ok(())
}
