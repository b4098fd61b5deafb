//! Output rendering for the `certctl` binary.
//!
//! Every renderer returns the text to print so the binary decides where it
//! goes: results on stdout, human-readable errors on stderr.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use certctl_common::CertError;
use certctl_config::ValidationResult;

use crate::app::{CertificateView, IssueOutcome, IssuePlan, PlannedAction, RevokeOutcome};
use crate::renewal::RenewalReport;
use crate::store::{ExportedFiles, StoredCertificate};

/// Output format selected with `--output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

impl OutputFormat {
    pub fn is_json(&self) -> bool {
        matches!(self, Self::Json)
    }
}

/// A rendered error and the stream it belongs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedError {
    pub text: String,
    pub to_stderr: bool,
    pub exit_code: i32,
}

pub fn render_error(error: &CertError, format: OutputFormat) -> RenderedError {
    let exit_code = error.exit_code();
    match format {
        OutputFormat::Human => RenderedError {
            text: format!("error[{}]: {}", error.kind(), error),
            to_stderr: true,
            exit_code,
        },
        OutputFormat::Json => RenderedError {
            text: pretty(&json!({
                "error": {
                    "kind": error.kind().as_str(),
                    "message": error.to_string(),
                    "exit_code": exit_code,
                }
            })),
            to_stderr: false,
            exit_code,
        },
    }
}

pub fn render_issue(
    outcome: &IssueOutcome,
    exported: &[ExportedFiles],
    format: OutputFormat,
) -> String {
    let cert = outcome.certificate();
    match format {
        OutputFormat::Human => {
            let verb = if outcome.changed() {
                "issued"
            } else {
                "unchanged (valid certificate exists, use --force to reissue)"
            };
            let mut out = format!(
                "{}: {}\n  serial:     {}\n  names:      {}\n  expires:    {}\n",
                cert.identity,
                verb,
                cert.info.serial,
                cert.info.sans.join(", "),
                date(cert.info.not_after),
            );
            out.push_str(&export_lines(exported));
            out
        }
        OutputFormat::Json => pretty(&with_exports(
            json!({
                "identity": cert.identity,
                "changed": outcome.changed(),
                "certificate": stored_json(cert),
            }),
            exported,
        )),
    }
}

/// `issue --dry-run`: what would be requested, and from whom.
pub fn render_plan(plan: &IssuePlan, format: OutputFormat) -> String {
    match format {
        OutputFormat::Human => {
            let verb = match plan.action {
                PlannedAction::Issue => "would be issued",
                PlannedAction::Reissue => "would be reissued",
                PlannedAction::Unchanged => "unchanged (valid certificate exists)",
            };
            let mut out = format!(
                "{}: {} (dry run, nothing written)\n  names:      {}\n  key:        {}\n  validity:   {} days\n  authority:  {}\n",
                plan.identity,
                verb,
                plan.request.sans.join(", "),
                plan.request.key_algorithm,
                plan.request.validity_days,
                plan.authority,
            );
            if let Some(serial) = &plan.replaces {
                out.push_str(&format!("  replaces:   {}\n", serial));
            }
            out
        }
        OutputFormat::Json => pretty(&json!({
            "dry_run": true,
            "identity": plan.identity,
            "action": plan.action,
            "authority": plan.authority,
            "names": plan.request.sans,
            "key_algorithm": plan.request.key_algorithm,
            "validity_days": plan.request.validity_days,
            "replaces": plan.replaces,
            "csr_pem": plan.request.csr_pem,
        })),
    }
}

pub fn render_renewed(
    cert: &StoredCertificate,
    exported: &[ExportedFiles],
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Human => {
            let mut out = format!(
                "{}: renewed\n  serial:     {}\n  expires:    {}\n",
                cert.identity,
                cert.info.serial,
                date(cert.info.not_after),
            );
            out.push_str(&export_lines(exported));
            out
        }
        OutputFormat::Json => pretty(&with_exports(
            json!({
                "identity": cert.identity,
                "renewed": true,
                "certificate": stored_json(cert),
            }),
            exported,
        )),
    }
}

pub fn render_exports(exported: &[ExportedFiles], format: OutputFormat) -> String {
    match format {
        OutputFormat::Human => exported
            .iter()
            .map(|files| {
                format!(
                    "{}: exported\n  certificate: {}\n  key:         {}\n  expires:     {}\n",
                    files.identity,
                    files.cert_path.display(),
                    files.key_path.display(),
                    date(files.not_after),
                )
            })
            .collect(),
        OutputFormat::Json => pretty(&json!({ "exported": exported })),
    }
}

pub fn render_report(
    report: &RenewalReport,
    exported: &[ExportedFiles],
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Human => {
            let mut out = format!(
                "renewal: {} queued, {} renewed, {} failed\n",
                report.queued.len(),
                report.renewed.len(),
                report.failed.len()
            );
            for identity in &report.renewed {
                out.push_str(&format!("  renewed  {}\n", identity));
            }
            for (identity, error) in &report.failed {
                let fatal = report.fatal.contains(identity);
                out.push_str(&format!(
                    "  {}  {}: error[{}]: {}\n",
                    if fatal { "FATAL " } else { "failed" },
                    identity,
                    error.kind(),
                    error
                ));
            }
            out.push_str(&export_lines(exported));
            out
        }
        OutputFormat::Json => pretty(&with_exports(json!({
            "queued": report.queued,
            "renewed": report.renewed,
            "failed": report
                .failed
                .iter()
                .map(|(identity, error)| json!({
                    "identity": identity,
                    "kind": error.kind().as_str(),
                    "message": error.to_string(),
                    "fatal": report.fatal.contains(identity),
                }))
                .collect::<Vec<_>>(),
        }), exported)),
    }
}

pub fn render_revoke(outcome: &RevokeOutcome, format: OutputFormat) -> String {
    match format {
        OutputFormat::Human => format!(
            "{}: revoked serial {}{}\n",
            outcome.identity,
            outcome.serial,
            if outcome.deleted {
                ", removed from store"
            } else {
                ", kept as revoked"
            }
        ),
        OutputFormat::Json => pretty(&json!(outcome)),
    }
}

pub fn render_list(views: &[CertificateView], format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => pretty(&json!(views)),
        OutputFormat::Human if views.is_empty() => "no certificates\n".to_string(),
        OutputFormat::Human => {
            let width = views
                .iter()
                .map(|v| v.identity.as_str().len())
                .max()
                .unwrap_or(0)
                .max("IDENTITY".len());
            let mut out = format!(
                "{:<width$}  {:<8}  {:<10}  {:>9}  {:<12}  {}\n",
                "IDENTITY",
                "STATUS",
                "EXPIRES",
                "DAYS LEFT",
                "RENEWAL",
                "NAMES",
                width = width
            );
            for view in views {
                let renewal = match &view.renewal {
                    Some(task) => task.state.as_str().to_string(),
                    None if view.due => "due".to_string(),
                    None => "-".to_string(),
                };
                let marker = if view.needs_attention { " !" } else { "" };
                out.push_str(&format!(
                    "{:<width$}  {:<8}  {:<10}  {:>9}  {:<12}  {}{}\n",
                    view.identity.as_str(),
                    view.status.as_str(),
                    date(view.not_after),
                    view.days_left,
                    renewal,
                    view.sans.join(","),
                    marker,
                    width = width
                ));
            }
            out
        }
    }
}

pub fn render_certificate(view: &CertificateView, format: OutputFormat) -> String {
    if format.is_json() {
        return pretty(&json!(view));
    }

    let mut out = String::new();
    let mut line = |label: &str, value: String| {
        out.push_str(&format!("{:<16}{}\n", format!("{}:", label), value));
    };
    line("identity", view.identity.to_string());
    line("status", view.status.to_string());
    line("subject", view.subject.clone());
    line("issuer", view.issuer.clone());
    line("serial", view.serial.clone());
    line("names", view.sans.join(", "));
    line("key", format!("{} ({})", view.key_algorithm, view.key_id));
    line("not before", view.not_before.to_rfc3339());
    line("not after", format!("{} ({} days left)", view.not_after.to_rfc3339(), view.days_left));
    line("renew at", view.renew_at.to_rfc3339());
    line("chain", format!("{} certificate(s)", view.chain_len));
    line("generation", view.generation.to_string());
    line("committed", view.committed_at.to_rfc3339());
    if let Some(revoked_at) = view.revoked_at {
        line("revoked", revoked_at.to_rfc3339());
    }
    if let Some(previous) = &view.previous_serial {
        line("previous", previous.clone());
    }
    if let Some(task) = &view.renewal {
        line(
            "renewal",
            format!("{} after {} failure(s)", task.state, task.consecutive_failures),
        );
        if let Some(at) = task.next_attempt_at {
            line("next attempt", at.to_rfc3339());
        }
        if let Some(error) = &task.last_error {
            line("last error", error.clone());
        }
    }
    if view.needs_attention {
        line("attention", "certificate needs operator attention".to_string());
    }
    out
}

pub fn render_validation(path: &str, result: &ValidationResult, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => pretty(&json!({
            "config": path,
            "valid": result.is_valid(),
            "errors": result.errors,
            "warnings": result.warnings,
        })),
        OutputFormat::Human => {
            let mut out = String::new();
            for error in &result.errors {
                out.push_str(&format!("error: {}\n", error));
            }
            for warning in &result.warnings {
                out.push_str(&format!("warning: {}\n", warning));
            }
            if result.is_valid() {
                out.push_str(&format!("certctl: configuration {} is valid\n", path));
            } else {
                out.push_str(&format!(
                    "certctl: configuration {} has {} error(s)\n",
                    path,
                    result.errors.len()
                ));
            }
            out
        }
    }
}

fn stored_json(cert: &StoredCertificate) -> Value {
    json!({
        "serial": cert.info.serial,
        "subject": cert.info.subject,
        "issuer": cert.info.issuer,
        "sans": cert.info.sans,
        "key_algorithm": cert.key_algorithm,
        "not_before": cert.info.not_before,
        "not_after": cert.info.not_after,
        "status": cert.status,
        "generation": cert.generation,
    })
}

fn export_lines(exported: &[ExportedFiles]) -> String {
    exported
        .iter()
        .map(|files| {
            format!(
                "  exported:   {}, {}\n",
                files.cert_path.display(),
                files.key_path.display()
            )
        })
        .collect()
}

fn with_exports(mut value: Value, exported: &[ExportedFiles]) -> Value {
    if !exported.is_empty() {
        value["exported"] = json!(exported);
    }
    value
}

fn date(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

fn pretty(value: &Value) -> String {
    let mut text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_human_error_format() {
        let err = CertError::NotFound("example.com".to_string());
        let rendered = render_error(&err, OutputFormat::Human);
        assert!(rendered.text.starts_with("error[NotFound]: "));
        assert!(rendered.to_stderr);
        assert_eq!(rendered.exit_code, 3);
    }

    #[test]
    fn test_json_error_format() {
        let err = CertError::Timeout {
            operation: "submit".to_string(),
            elapsed: Duration::from_secs(30),
        };
        let rendered = render_error(&err, OutputFormat::Json);
        assert!(!rendered.to_stderr);
        assert_eq!(rendered.exit_code, 2);

        let value: Value = serde_json::from_str(&rendered.text).unwrap();
        assert_eq!(value["error"]["kind"], "Timeout");
        assert_eq!(value["error"]["exit_code"], 2);
        assert!(value["error"]["message"].as_str().unwrap().contains("submit"));
    }

    #[test]
    fn test_empty_list() {
        assert_eq!(render_list(&[], OutputFormat::Human), "no certificates\n");
        let value: Value = serde_json::from_str(&render_list(&[], OutputFormat::Json)).unwrap();
        assert_eq!(value, json!([]));
    }

    #[test]
    fn test_report_marks_fatal_failures() {
        let identity = certctl_common::Identity::new("example.com").unwrap();
        let report = RenewalReport {
            failed: vec![(
                identity.clone(),
                CertError::AuthorityUnreachable("down".to_string()),
            )],
            fatal: vec![identity],
            ..RenewalReport::default()
        };

        let human = render_report(&report, &[], OutputFormat::Human);
        assert!(human.contains("FATAL"));
        assert!(human.contains("error[AuthorityUnreachable]"));

        let value: Value =
            serde_json::from_str(&render_report(&report, &[], OutputFormat::Json)).unwrap();
        assert_eq!(value["failed"][0]["fatal"], true);
        assert_eq!(value["failed"][0]["identity"], "example.com");
        assert!(value.get("exported").is_none());
    }

    #[test]
    fn test_exports_are_listed() {
        let files = ExportedFiles {
            identity: certctl_common::Identity::new("example.com").unwrap(),
            cert_path: "certs/example.com/example.com.pem".into(),
            key_path: "certs/example.com/example.com.key".into(),
            key_id: crate::request::KeyId::from_public_key(b"public key"),
            serial: "01".to_string(),
            not_after: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        };
        let report = RenewalReport {
            renewed: vec![files.identity.clone()],
            ..RenewalReport::default()
        };

        let human = render_report(&report, std::slice::from_ref(&files), OutputFormat::Human);
        assert!(human.contains("exported:   certs/example.com/example.com.pem"));

        let value: Value = serde_json::from_str(&render_exports(
            std::slice::from_ref(&files),
            OutputFormat::Json,
        ))
        .unwrap();
        assert_eq!(value["exported"][0]["identity"], "example.com");
        assert_eq!(
            value["exported"][0]["key_path"],
            "certs/example.com/example.com.key"
        );
    }

    #[test]
    fn test_validation_output() {
        let mut result = ValidationResult::new();
        result.add_warning(certctl_config::ValidationWarning::new("staging directory"));
        let human = render_validation("config.kdl", &result, OutputFormat::Human);
        assert!(human.contains("warning: staging directory"));
        assert!(human.contains("is valid"));
    }
}
