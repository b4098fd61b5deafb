//! Configuration for certctl.
//!
//! Configuration is written in KDL. Every section is optional; a missing
//! file or a missing section falls back to built-in defaults.
//!
//! ```kdl
//! store { path "/var/lib/certctl" }
//! authority "acme" {
//!     directory "https://acme-staging-v02.api.letsencrypt.org/directory"
//!     email "ops@example.com"
//!     challenge "dns-01"
//! }
//! renewal { threshold-fraction 0.33 }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use validator::Validate;

use certctl_common::{ChallengeKind, KeyAlgorithm, RenewalThreshold, RetryPolicy};

pub mod kdl;
pub mod validate;

pub use validate::{
    ErrorCategory, InvalidConfig, ValidationError, ValidationResult, ValidationWarning,
};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "CERTCTL_CONFIG";

/// Environment variable holding the base64 store master key.
pub const STORE_KEY_ENV: &str = "CERTCTL_STORE_KEY";

/// Let's Encrypt production directory.
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory.
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

// ============================================================================
// Top-level configuration
// ============================================================================

/// Complete certctl configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub store: StoreConfig,
    #[validate(nested)]
    pub authority: AuthorityConfig,
    #[validate(nested)]
    pub issuance: IssuanceConfig,
    #[validate(nested)]
    pub renewal: RenewalConfig,
    #[validate(nested)]
    pub policy: PolicyConfig,
    #[validate(nested)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Default configuration file location (`$XDG_CONFIG_HOME/certctl/config.kdl`).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "certctl")
            .map(|dirs| dirs.config_dir().join("config.kdl"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, the default path is used
    /// when present and built-in defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(default) if default.exists() => Self::from_file(&default),
                _ => {
                    debug!("No configuration file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    /// Load configuration from a KDL file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_kdl_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from KDL text.
    pub fn from_kdl_str(content: &str) -> Result<Self> {
        kdl::parse_config(content)
    }

    /// Validate field constraints, cross-section rules and trust anchors,
    /// then lint for risky settings.
    pub fn validate(&self) -> ValidationResult {
        validate::validate_config(self)
    }
}

// ============================================================================
// Store
// ============================================================================

/// Key and certificate store location.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoreConfig {
    /// Store root directory.
    pub path: PathBuf,
    /// Environment variable consulted for the master key.
    #[validate(length(min = 1))]
    pub key_env: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            key_env: STORE_KEY_ENV.to_string(),
        }
    }
}

fn default_store_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "certctl")
        .map(|dirs| dirs.data_dir().join("store"))
        .unwrap_or_else(|| PathBuf::from("certctl-store"))
}

// ============================================================================
// Authority
// ============================================================================

/// Which certificate authority issues certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorityKind {
    /// ACME v2 server such as Let's Encrypt.
    #[default]
    Acme,
    /// Private CA kept in the store.
    Local,
}

impl AuthorityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acme => "acme",
            Self::Local => "local",
        }
    }
}

/// Authority settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuthorityConfig {
    pub kind: AuthorityKind,
    /// ACME directory URL.
    #[validate(url)]
    pub directory_url: String,
    /// ACME account contact.
    #[validate(email)]
    pub email: Option<String>,
    pub challenge: ChallengeKind,
    /// Webroot served by an existing HTTP server, for HTTP-01.
    pub webroot: Option<PathBuf>,
    /// How long to wait for a DNS-01 record to become visible.
    #[validate(range(min = 10, max = 3600))]
    pub dns_propagation_timeout_secs: u64,
    #[validate(range(min = 1, max = 600))]
    pub dns_check_interval_secs: u64,
    /// Leaf validity issued by the local CA.
    #[validate(range(min = 1, max = 3650))]
    pub local_validity_days: u32,
    /// Common name of the local root CA.
    #[validate(length(min = 1, max = 64))]
    pub local_ca_name: String,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            kind: AuthorityKind::Acme,
            directory_url: LETS_ENCRYPT_PRODUCTION.to_string(),
            email: None,
            challenge: ChallengeKind::Dns01,
            webroot: None,
            dns_propagation_timeout_secs: 300,
            dns_check_interval_secs: 10,
            local_validity_days: 90,
            local_ca_name: "certctl Local CA".to_string(),
        }
    }
}

impl AuthorityConfig {
    pub fn is_staging(&self) -> bool {
        self.directory_url.contains("staging")
    }
}

// ============================================================================
// Issuance
// ============================================================================

/// Issuance engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IssuanceConfig {
    /// Timeout applied to every authority step.
    #[validate(range(min = 1, max = 600))]
    pub step_timeout_secs: u64,
    /// Attempts per step, including the first one.
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    #[validate(range(min = 1))]
    pub backoff_initial_ms: u64,
    #[validate(range(min = 1))]
    pub backoff_max_ms: u64,
    /// Delay between validation polls.
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
    /// Validation polls before the challenge is declared failed.
    #[validate(range(min = 1, max = 1000))]
    pub max_polls: u32,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 30,
            max_attempts: 4,
            backoff_initial_ms: 2_000,
            backoff_max_ms: 60_000,
            poll_interval_ms: 2_000,
            max_polls: 30,
        }
    }
}

impl IssuanceConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
        .with_jitter(0.1)
    }
}

// ============================================================================
// Renewal
// ============================================================================

/// Renewal scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RenewalConfig {
    /// Interval between scans in `run` mode.
    #[validate(range(min = 60))]
    pub check_interval_secs: u64,
    /// Renew once this fraction of the validity period remains.
    #[validate(range(min = 0.0, max = 1.0))]
    pub threshold_fraction: f64,
    /// Fixed renewal window before expiry. Takes precedence over the fraction.
    #[validate(range(min = 1, max = 365))]
    pub renew_before_days: Option<u32>,
    /// Consecutive failures before a task is marked fatal.
    #[validate(range(min = 1, max = 100))]
    pub max_consecutive_failures: u32,
    /// Renewals executed in parallel.
    #[validate(range(min = 1, max = 64))]
    pub max_concurrent: usize,
    /// Base delay before a failed renewal is retried.
    #[validate(range(min = 1))]
    pub retry_backoff_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 12 * 60 * 60,
            threshold_fraction: 1.0 / 3.0,
            renew_before_days: None,
            max_consecutive_failures: 5,
            max_concurrent: 4,
            retry_backoff_secs: 3_600,
        }
    }
}

impl RenewalConfig {
    pub fn threshold(&self) -> RenewalThreshold {
        match self.renew_before_days {
            Some(days) => RenewalThreshold::BeforeExpiry(Duration::from_secs(
                u64::from(days) * 24 * 60 * 60,
            )),
            None => RenewalThreshold::RemainingFraction(self.threshold_fraction),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Backoff applied to `next_attempt_at` after failed renewals.
    pub fn retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_secs(self.retry_backoff_secs);
        RetryPolicy::new(self.max_consecutive_failures, initial, initial * 24)
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Issuance policy enforced before and after issuance.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PolicyConfig {
    #[validate(length(min = 1))]
    pub allowed_algorithms: Vec<KeyAlgorithm>,
    #[validate(range(min = 80, max = 256))]
    pub min_security_bits: u32,
    pub allow_wildcards: bool,
    #[validate(range(min = 1, max = 100))]
    pub max_sans: usize,
    /// Name suffixes that may never be issued.
    pub denied_suffixes: Vec<String>,
    /// Extra PEM root certificates trusted when validating chains.
    pub trust_anchors: Vec<PathBuf>,
    /// Upper bound on leaf validity.
    #[validate(range(min = 1, max = 3650))]
    pub max_validity_days: u32,
    /// Keep revoked certificates in the store instead of deleting them.
    pub retain_revoked: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_algorithms: KeyAlgorithm::ALL.to_vec(),
            min_security_bits: 128,
            allow_wildcards: true,
            max_sans: 100,
            denied_suffixes: Vec::new(),
            trust_anchors: Vec::new(),
            max_validity_days: 398,
            retain_revoked: false,
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings. `RUST_LOG` and `--verbose` take precedence.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    #[validate(length(min = 1))]
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}
