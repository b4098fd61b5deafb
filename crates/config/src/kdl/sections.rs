//! Section parsers for the KDL configuration.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use certctl_common::{ChallengeKind, KeyAlgorithm};

use crate::*;

use super::helpers::{
    get_bool_entry, get_first_arg_string, get_float_entry, get_int_entry, get_string_entry,
    get_string_list,
};

fn non_negative<T: TryFrom<i128>>(node: &::kdl::KdlNode, name: &str) -> Result<Option<T>> {
    match get_int_entry(node, name) {
        Some(v) => T::try_from(v).map(Some).map_err(|_| {
            anyhow::anyhow!(
                "'{}' in '{}' is out of range: {}",
                name,
                node.name().value(),
                v
            )
        }),
        None => Ok(None),
    }
}

/// Parse store configuration block
pub fn parse_store_config(node: &::kdl::KdlNode) -> Result<StoreConfig> {
    trace!("Parsing store configuration block");
    let defaults = StoreConfig::default();

    let config = StoreConfig {
        path: get_string_entry(node, "path")
            .map(PathBuf::from)
            .unwrap_or(defaults.path),
        key_env: get_string_entry(node, "key-env").unwrap_or(defaults.key_env),
    };

    trace!(path = %config.path.display(), "Parsed store configuration");
    Ok(config)
}

/// Parse authority configuration block
///
/// The authority kind is the node argument: `authority "acme" { ... }`.
pub fn parse_authority_config(node: &::kdl::KdlNode) -> Result<AuthorityConfig> {
    trace!("Parsing authority configuration block");
    let defaults = AuthorityConfig::default();

    let kind = match get_first_arg_string(node).as_deref() {
        None | Some("acme") => AuthorityKind::Acme,
        Some("local") => AuthorityKind::Local,
        Some(other) => {
            return Err(anyhow::anyhow!(
                "Invalid authority '{}'. Valid authorities: acme, local",
                other
            ));
        }
    };

    let challenge = match get_string_entry(node, "challenge") {
        Some(s) => s.parse::<ChallengeKind>().map_err(|e| anyhow::anyhow!(e))?,
        None => match kind {
            AuthorityKind::Acme => defaults.challenge,
            AuthorityKind::Local => ChallengeKind::Http01,
        },
    };

    let directory_url = match get_string_entry(node, "directory") {
        Some(url) if url == "staging" => LETS_ENCRYPT_STAGING.to_string(),
        Some(url) if url == "production" => LETS_ENCRYPT_PRODUCTION.to_string(),
        Some(url) => url,
        None => defaults.directory_url,
    };

    let config = AuthorityConfig {
        kind,
        directory_url,
        email: get_string_entry(node, "email"),
        challenge,
        webroot: get_string_entry(node, "webroot").map(PathBuf::from),
        dns_propagation_timeout_secs: non_negative(node, "dns-propagation-timeout-secs")?
            .unwrap_or(defaults.dns_propagation_timeout_secs),
        dns_check_interval_secs: non_negative(node, "dns-check-interval-secs")?
            .unwrap_or(defaults.dns_check_interval_secs),
        local_validity_days: non_negative(node, "validity-days")?
            .unwrap_or(defaults.local_validity_days),
        local_ca_name: get_string_entry(node, "ca-name").unwrap_or(defaults.local_ca_name),
    };

    trace!(
        kind = config.kind.as_str(),
        directory = %config.directory_url,
        challenge = %config.challenge,
        "Parsed authority configuration"
    );

    Ok(config)
}

/// Parse issuance configuration block
pub fn parse_issuance_config(node: &::kdl::KdlNode) -> Result<IssuanceConfig> {
    trace!("Parsing issuance configuration block");
    let defaults = IssuanceConfig::default();

    let config = IssuanceConfig {
        step_timeout_secs: non_negative(node, "step-timeout-secs")?
            .unwrap_or(defaults.step_timeout_secs),
        max_attempts: non_negative(node, "max-attempts")?.unwrap_or(defaults.max_attempts),
        backoff_initial_ms: non_negative(node, "backoff-initial-ms")?
            .unwrap_or(defaults.backoff_initial_ms),
        backoff_max_ms: non_negative(node, "backoff-max-ms")?.unwrap_or(defaults.backoff_max_ms),
        poll_interval_ms: non_negative(node, "poll-interval-ms")?
            .unwrap_or(defaults.poll_interval_ms),
        max_polls: non_negative(node, "max-polls")?.unwrap_or(defaults.max_polls),
    };

    trace!(
        step_timeout_secs = config.step_timeout_secs,
        max_attempts = config.max_attempts,
        max_polls = config.max_polls,
        "Parsed issuance configuration"
    );

    Ok(config)
}

/// Parse renewal configuration block
pub fn parse_renewal_config(node: &::kdl::KdlNode) -> Result<RenewalConfig> {
    trace!("Parsing renewal configuration block");
    let defaults = RenewalConfig::default();

    let config = RenewalConfig {
        check_interval_secs: non_negative(node, "check-interval-secs")?
            .unwrap_or(defaults.check_interval_secs),
        threshold_fraction: get_float_entry(node, "threshold-fraction")
            .unwrap_or(defaults.threshold_fraction),
        renew_before_days: non_negative(node, "renew-before-days")?,
        max_consecutive_failures: non_negative(node, "max-consecutive-failures")?
            .unwrap_or(defaults.max_consecutive_failures),
        max_concurrent: non_negative(node, "max-concurrent")?.unwrap_or(defaults.max_concurrent),
        retry_backoff_secs: non_negative(node, "retry-backoff-secs")?
            .unwrap_or(defaults.retry_backoff_secs),
    };

    trace!(
        threshold_fraction = config.threshold_fraction,
        renew_before_days = ?config.renew_before_days,
        max_concurrent = config.max_concurrent,
        "Parsed renewal configuration"
    );

    Ok(config)
}

/// Parse policy configuration block
pub fn parse_policy_config(node: &::kdl::KdlNode) -> Result<PolicyConfig> {
    trace!("Parsing policy configuration block");
    let defaults = PolicyConfig::default();

    let names = get_string_list(node, "allowed-algorithms");
    let allowed_algorithms = if names.is_empty() {
        defaults.allowed_algorithms
    } else {
        names
            .iter()
            .map(|name| name.parse::<KeyAlgorithm>())
            .collect::<Result<Vec<_>, _>>()?
    };

    let config = PolicyConfig {
        allowed_algorithms,
        min_security_bits: non_negative(node, "min-security-bits")?
            .unwrap_or(defaults.min_security_bits),
        allow_wildcards: get_bool_entry(node, "allow-wildcards")
            .unwrap_or(defaults.allow_wildcards),
        max_sans: non_negative(node, "max-sans")?.unwrap_or(defaults.max_sans),
        denied_suffixes: get_string_list(node, "denied-suffixes")
            .into_iter()
            .map(|s| s.trim_start_matches('.').to_ascii_lowercase())
            .collect(),
        trust_anchors: get_string_list(node, "trust-anchor")
            .into_iter()
            .map(PathBuf::from)
            .collect(),
        max_validity_days: non_negative(node, "max-validity-days")?
            .unwrap_or(defaults.max_validity_days),
        retain_revoked: get_bool_entry(node, "retain-revoked").unwrap_or(defaults.retain_revoked),
    };

    trace!(
        algorithms = config.allowed_algorithms.len(),
        min_security_bits = config.min_security_bits,
        allow_wildcards = config.allow_wildcards,
        trust_anchors = config.trust_anchors.len(),
        "Parsed policy configuration"
    );

    Ok(config)
}

/// Parse logging configuration block
pub fn parse_logging_config(node: &::kdl::KdlNode) -> Result<LoggingConfig> {
    trace!("Parsing logging configuration block");
    let defaults = LoggingConfig::default();

    let format = match get_string_entry(node, "format").as_deref() {
        None => defaults.format,
        Some("text") | Some("pretty") => LogFormat::Text,
        Some("json") => LogFormat::Json,
        Some(other) => {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}'. Valid formats: text, json",
                other
            ));
        }
    };

    Ok(LoggingConfig {
        level: get_string_entry(node, "level").unwrap_or(defaults.level),
        format,
    })
}
