//! Configuration linting for best practices
//!
//! Flags settings that work but are likely to cause trouble in production.

use super::{ValidationResult, ValidationWarning};
use crate::{AuthorityKind, Config};
use certctl_common::ChallengeKind;

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let authority = &config.authority;

    if authority.kind == AuthorityKind::Acme {
        if authority.email.is_none() {
            result.add_warning(ValidationWarning::new(
                "ACME account has no contact email (expiry notices cannot be delivered)",
            ));
        }

        if authority.is_staging() {
            result.add_warning(ValidationWarning::new(format!(
                "ACME directory '{}' is a staging endpoint (certificates will not be publicly trusted)",
                authority.directory_url
            )));
        }

        // Wildcard names can only be proven over DNS
        if config.policy.allow_wildcards && authority.challenge == ChallengeKind::Http01 {
            result.add_warning(ValidationWarning::new(
                "Wildcards are allowed but the challenge is http-01 (ACME requires dns-01 for wildcards)",
            ));
        }
    }

    if config.issuance.max_attempts == 1 {
        result.add_warning(ValidationWarning::new(
            "issuance max-attempts is 1 (transient authority errors will not be retried)",
        ));
    }

    if config.renewal.renew_before_days.is_none() && config.renewal.threshold_fraction < 0.1 {
        result.add_warning(ValidationWarning::new(format!(
            "Renewal threshold-fraction {} leaves little time to recover from failed renewals",
            config.renewal.threshold_fraction
        )));
    }

    if config.policy.retain_revoked {
        result.add_warning(ValidationWarning::new(
            "retain-revoked keeps revoked keys in the store (delete them once no longer needed)",
        ));
    }

    result
}
