//! Runs the `certctl` binary against a local authority in a temporary store
//! and checks exit codes and error output.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

fn certctl_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_certctl"))
}

/// A store directory and a configuration file next to it.
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(config: &str) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("certctl.kdl"), config).unwrap();
        Self { dir }
    }

    fn local() -> Self {
        Self::new("authority \"local\" {\n    ca-name \"CLI Test CA\"\n}\n")
    }

    fn rewrite_config(&self, config: &str) {
        std::fs::write(self.dir.path().join("certctl.kdl"), config).unwrap();
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(certctl_bin())
            .arg("--config")
            .arg(self.path().join("certctl.kdl"))
            .arg("--store")
            .arg(self.path().join("store"))
            .args(args)
            .env_remove("CERTCTL_CONFIG")
            .env_remove("CERTCTL_STORE")
            .env_remove("CERTCTL_STORE_KEY")
            .env("RUST_LOG", "warn")
            .output()
            .unwrap()
    }
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({}): {}",
            e,
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_invalid_config_exits_before_touching_store() {
    let ws = Workspace::new("authority \"local\"\nissuance {\n    max-attempts 0\n}\n");

    let output = ws.run(&["list"]);
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("error[Config]"), "{}", err);
    assert!(err.contains("max-attempts"), "{}", err);
    assert!(!ws.path().join("store").exists());

    let output = ws.run(&["--output", "json", "issue", "--subject", "example.com"]);
    assert_eq!(output.status.code(), Some(1));
    let value = stdout_json(&output);
    assert_eq!(value["error"]["kind"], "Config");
    assert_eq!(value["error"]["exit_code"], 1);
}

#[test]
fn test_check_config_reports_errors() {
    let ws = Workspace::new("authority \"local\" {\n    challenge \"dns-01\"\n}\n");

    let output = ws.run(&["check-config"]);
    assert_eq!(output.status.code(), Some(1));

    ws.rewrite_config("authority \"local\"\n");
    let output = ws.run(&["check-config"]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
}

#[test]
fn test_issue_inspect_and_missing_identity() {
    let ws = Workspace::local();

    let output = ws.run(&["issue", "--subject", "example.com", "--san", "www.example.com"]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("example.com: issued"));

    let output = ws.run(&["--output", "json", "inspect", "--identity", "example.com"]);
    assert_eq!(output.status.code(), Some(0));
    let value = stdout_json(&output);
    assert_eq!(value["status"], "active");
    assert_eq!(value["sans"][1], "www.example.com");

    let output = ws.run(&["inspect", "--identity", "missing.example.com"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("error[NotFound]"));
}

#[test]
fn test_invalid_subject_exits_with_validation_code() {
    let ws = Workspace::local();

    let output = ws.run(&["issue", "--subject", "exa mple.com"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error[InvalidSubject]"));

    let output = ws.run(&["issue", "--subject", "example.com", "--key-alg", "rsa-1024"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error[UnsupportedAlgorithm]"));
}

#[test]
fn test_revoked_identity_is_gone() {
    let ws = Workspace::local();
    assert_eq!(ws.run(&["issue", "--subject", "example.com"]).status.code(), Some(0));

    let output = ws.run(&["revoke", "--identity", "example.com"]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));

    let output = ws.run(&["--output", "json", "inspect", "--identity", "example.com"]);
    assert_eq!(output.status.code(), Some(3));
    let value = stdout_json(&output);
    assert_eq!(value["error"]["kind"], "NotFound");
    assert_eq!(value["error"]["exit_code"], 3);
}

#[test]
fn test_renew_with_failures_exits_with_first_error_code() {
    let ws = Workspace::local();
    assert_eq!(ws.run(&["issue", "--subject", "example.com"]).status.code(), Some(0));

    // Everything is due, and the policy now refuses the stored names.
    ws.rewrite_config(
        "authority \"local\"\nrenewal {\n    threshold-fraction 1.0\n}\npolicy {\n    denied-suffixes \"example.com\"\n}\n",
    );
    let output = ws.run(&["--output", "json", "renew"]);
    assert_eq!(output.status.code(), Some(1), "{}", stderr(&output));
    let value = stdout_json(&output);
    assert_eq!(value["renewed"], Value::Array(Vec::new()));
    assert_eq!(value["failed"][0]["identity"], "example.com");
    assert_eq!(value["failed"][0]["kind"], "PolicyViolation");

    let output = ws.run(&["--output", "json", "inspect", "--identity", "example.com"]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)["renewal"]["state"], "failed-retry");
}

#[test]
fn test_renew_all_succeeds_and_exports() {
    let ws = Workspace::local();
    assert_eq!(ws.run(&["issue", "--subject", "example.com"]).status.code(), Some(0));

    ws.rewrite_config("authority \"local\"\nrenewal {\n    threshold-fraction 1.0\n}\n");
    let out = ws.path().join("certs");
    let output = ws.run(&["--output", "json", "renew", "--out", out.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    let value = stdout_json(&output);
    assert_eq!(value["renewed"][0], "example.com");
    assert!(out.join("example.com").join("example.com.pem").exists());
    assert!(out.join("example.com").join("example.com.key").exists());
}

#[test]
fn test_export_writes_pem_files() {
    let ws = Workspace::local();
    let out = ws.path().join("certs");

    let output = ws.run(&["export", "--identity", "example.com", "--out", out.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(3));

    let output = ws.run(&[
        "issue",
        "--subject",
        "example.com",
        "--out",
        out.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    let cert_path = out.join("example.com").join("example.com.pem");
    let first = std::fs::read_to_string(&cert_path).unwrap();
    assert!(first.starts_with("-----BEGIN CERTIFICATE-----"));

    let output = ws.run(&[
        "--output",
        "json",
        "export",
        "--identity",
        "example.com",
        "--out",
        out.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(0));
    let value = stdout_json(&output);
    assert_eq!(value["exported"][0]["identity"], "example.com");
    assert_eq!(std::fs::read_to_string(&cert_path).unwrap(), first);

    let key = std::fs::read_to_string(out.join("example.com").join("example.com.key")).unwrap();
    assert!(key.contains("PRIVATE KEY"));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(out.join("example.com").join("example.com.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn test_dry_run_issues_nothing() {
    let ws = Workspace::local();

    let output = ws.run(&[
        "--output",
        "json",
        "issue",
        "--subject",
        "example.com",
        "--wildcard",
        "--dry-run",
    ]);
    assert_eq!(output.status.code(), Some(0), "{}", stderr(&output));
    let value = stdout_json(&output);
    assert_eq!(value["dry_run"], true);
    assert_eq!(value["action"], "issue");
    assert_eq!(value["names"][0], "example.com");
    assert_eq!(value["names"][1], "*.example.com");

    let output = ws.run(&["--output", "json", "list"]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output), Value::Array(Vec::new()));

    let output = ws.run(&["issue", "--subject", "exa mple.com", "--dry-run"]);
    assert_eq!(output.status.code(), Some(1));
}
