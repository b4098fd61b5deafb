//! Configuration validation.
//!
//! Validation runs in three passes:
//!
//! 1. field constraints declared with `validator` derives
//! 2. cross-section rules and trust anchor checks (errors)
//! 3. linting for risky but legal settings (warnings)

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::debug;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::{AuthorityKind, Config};
use certctl_common::ChallengeKind;

mod anchors;
mod lint;

pub use anchors::validate_trust_anchors;
pub use lint::lint_config;

/// Area of the configuration an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Config,
    Authority,
    Issuance,
    Renewal,
    Policy,
    Certificate,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Authority => "authority",
            Self::Issuance => "issuance",
            Self::Renewal => "renewal",
            Self::Policy => "policy",
            Self::Certificate => "certificate",
        };
        f.write_str(s)
    }
}

/// A configuration error. Any error makes the configuration unusable.
#[derive(Debug, Clone, Error, Serialize)]
#[error("[{category}] {message}")]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// A lint finding. The configuration still works.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Accumulated validation outcome.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fail if there is any error. Warnings stay with the returned result.
    pub fn into_result(self) -> Result<Self, InvalidConfig> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(InvalidConfig {
                errors: self.errors,
            })
        }
    }
}

/// A configuration that failed validation.
#[derive(Debug, Clone, Error)]
#[error("configuration has {} error(s): {}", .errors.len(), join_errors(.errors))]
pub struct InvalidConfig {
    pub errors: Vec<ValidationError>,
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Run every validation pass over a configuration.
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Err(errors) = Validate::validate(config) {
        collect_field_errors("", &errors, &mut result);
    }

    result.merge(validate_cross_section(config));
    result.merge(validate_trust_anchors(config));
    result.merge(lint_config(config));

    debug!(
        errors = result.errors.len(),
        warnings = result.warnings.len(),
        "Configuration validated"
    );

    result
}

fn collect_field_errors(prefix: &str, errors: &ValidationErrors, result: &mut ValidationResult) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            ValidationErrorsKind::Field(failures) => {
                for failure in failures {
                    let detail = match failure.params.get("value") {
                        Some(value) => format!("'{}' check failed for value {}", failure.code, value),
                        None => format!("'{}' check failed", failure.code),
                    };
                    result.add_error(ValidationError::new(
                        ErrorCategory::Config,
                        format!("{}: {}", path.replace('_', "-"), detail),
                    ));
                }
            }
            ValidationErrorsKind::Struct(inner) => collect_field_errors(&path, inner, result),
            ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    collect_field_errors(&format!("{}[{}]", path, index), inner, result);
                }
            }
        }
    }
}

/// Rules spanning more than one field.
fn validate_cross_section(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let authority = &config.authority;

    if authority.kind == AuthorityKind::Acme && authority.challenge == ChallengeKind::Http01 {
        match authority.webroot {
            None => result.add_error(ValidationError::new(
                ErrorCategory::Authority,
                "ACME http-01 requires a 'webroot' served on port 80, or use challenge \"dns-01\"",
            )),
            Some(ref webroot) if !webroot.is_dir() => result.add_error(ValidationError::new(
                ErrorCategory::Authority,
                format!("Webroot {:?} is not a directory", webroot),
            )),
            Some(_) => {}
        }
    }

    if config.issuance.backoff_initial_ms > config.issuance.backoff_max_ms {
        result.add_error(ValidationError::new(
            ErrorCategory::Issuance,
            format!(
                "backoff-initial-ms ({}) exceeds backoff-max-ms ({})",
                config.issuance.backoff_initial_ms, config.issuance.backoff_max_ms
            ),
        ));
    }

    if config.renewal.renew_before_days.is_none() && config.renewal.threshold_fraction <= 0.0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            "threshold-fraction must be greater than 0, certificates would only renew after expiry",
        ));
    }

    if authority.kind == AuthorityKind::Local {
        if authority.challenge != ChallengeKind::Http01 {
            result.add_error(ValidationError::new(
                ErrorCategory::Authority,
                "The local authority only issues http-01 challenges",
            ));
        }
        if authority.webroot.is_some() {
            result.add_error(ValidationError::new(
                ErrorCategory::Authority,
                "'webroot' cannot be used with the local authority, it answers its own challenges",
            ));
        }
        if authority.local_validity_days > config.policy.max_validity_days {
            result.add_error(ValidationError::new(
                ErrorCategory::Policy,
                format!(
                    "Local authority validity ({} days) exceeds policy max-validity-days ({})",
                    authority.local_validity_days, config.policy.max_validity_days
                ),
            ));
        }
        if let Some(days) = config.renewal.renew_before_days {
            if days >= authority.local_validity_days {
                result.add_error(ValidationError::new(
                    ErrorCategory::Renewal,
                    format!(
                        "renew-before-days ({}) is not shorter than the local validity ({} days)",
                        days, authority.local_validity_days
                    ),
                ));
            }
        }
    }

    let policy = &config.policy;
    if !policy.allowed_algorithms.is_empty()
        && policy
            .allowed_algorithms
            .iter()
            .all(|alg| alg.security_bits() < policy.min_security_bits)
    {
        result.add_error(ValidationError::new(
            ErrorCategory::Policy,
            format!(
                "No allowed algorithm reaches min-security-bits {}",
                policy.min_security_bits
            ),
        ));
    }

    result
}
