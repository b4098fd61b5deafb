//! Trust anchor validation
//!
//! Checks that configured trust anchors exist, parse as CA certificates and
//! have not expired.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Validate configured trust anchors
pub fn validate_trust_anchors(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    for path in &config.policy.trust_anchors {
        if !path.exists() {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("Trust anchor not found: {:?}", path),
            ));
            continue;
        }

        match load_and_validate_anchor(path) {
            Ok(warnings) => {
                for warning in warnings {
                    result.add_warning(warning);
                }
            }
            Err(e) => result.add_error(e),
        }
    }

    result
}

/// Load every certificate in an anchor file and check it can act as a root
fn load_and_validate_anchor(path: &Path) -> Result<Vec<ValidationWarning>, ValidationError> {
    let data = std::fs::read(path).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read trust anchor {:?}: {}", path, e),
        )
    })?;

    let blocks = pem::parse_many(&data).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse trust anchor {:?}: {}", path, e),
        )
    })?;

    let certs: Vec<_> = blocks.iter().filter(|b| b.tag() == "CERTIFICATE").collect();
    if certs.is_empty() {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!("Trust anchor {:?} contains no certificates", path),
        ));
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let thirty_days = Duration::from_secs(30 * 86400).as_secs() as i64;
    let mut warnings = Vec::new();

    for block in certs {
        let (_, cert) = x509_parser::parse_x509_certificate(block.contents()).map_err(|e| {
            ValidationError::new(
                ErrorCategory::Certificate,
                format!("Invalid X509 certificate in trust anchor {:?}: {}", path, e),
            )
        })?;

        if !cert.is_ca() {
            return Err(ValidationError::new(
                ErrorCategory::Certificate,
                format!(
                    "Trust anchor {:?} is not a CA certificate ({})",
                    path,
                    cert.subject()
                ),
            ));
        }

        let not_after = cert.validity().not_after.timestamp();
        if not_after < now {
            return Err(ValidationError::new(
                ErrorCategory::Certificate,
                format!(
                    "Trust anchor expired: {:?} (expired at {})",
                    path,
                    cert.validity().not_after
                ),
            ));
        }

        if not_after < now + thirty_days {
            warnings.push(ValidationWarning::new(format!(
                "Trust anchor expires soon: {:?} (expires at {})",
                path,
                cert.validity().not_after
            )));
        }
    }

    Ok(warnings)
}
