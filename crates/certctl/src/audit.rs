//! Append-only audit trail.
//!
//! One JSON object per line. Every terminal lifecycle transition and every
//! retry lands here; the log is never rewritten.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use certctl_common::{CertError, CertResult, ErrorKind, Identity, OperationId};

/// Audited lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEvent {
    Issued,
    Renewed,
    Revoked,
    Deleted,
    Rejected,
    /// A transient failure that will be retried.
    Retry,
    RenewalFailed,
    /// Chain and key written out as plain PEM files.
    Exported,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Renewed => "renewed",
            Self::Revoked => "revoked",
            Self::Deleted => "deleted",
            Self::Rejected => "rejected",
            Self::Retry => "retry",
            Self::RenewalFailed => "renewal-failed",
            Self::Exported => "exported",
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub identity: Identity,
    pub event: AuditEvent,
    pub operation: OperationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl AuditRecord {
    pub fn new(identity: &Identity, event: AuditEvent, operation: &OperationId) -> Self {
        Self {
            timestamp: Utc::now(),
            identity: identity.clone(),
            event,
            operation: operation.clone(),
            detail: None,
            error_kind: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach an error: its kind and message.
    pub fn with_error(mut self, error: &CertError) -> Self {
        self.error_kind = Some(error.kind());
        self.detail = Some(error.to_string());
        self
    }
}

/// File-backed audit log.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and sync it to disk.
    pub fn record(&self, record: &AuditRecord) -> CertResult<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| CertError::InternalStore(format!("audit encode: {}", e)))?;
        line.push('\n');

        let _guard = self.writer.lock();
        let mut file = self.open_append().map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| self.io_error(e))?;

        trace!(
            identity = %record.identity,
            event = %record.event,
            operation = %record.operation,
            "Audit record written"
        );
        Ok(())
    }

    /// Best-effort variant for paths that are already failing.
    pub fn record_or_warn(&self, record: &AuditRecord) {
        if let Err(e) = self.record(record) {
            warn!(identity = %record.identity, event = %record.event, error = %e, "Failed to write audit record");
        }
    }

    /// All records in write order. Malformed lines are skipped.
    pub fn read_all(&self) -> CertResult<Vec<AuditRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut records = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(line = number + 1, error = %e, "Skipping malformed audit line"),
            }
        }
        Ok(records)
    }

    pub fn for_identity(&self, identity: &Identity) -> CertResult<Vec<AuditRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| &r.identity == identity)
            .collect())
    }

    fn open_append(&self) -> std::io::Result<File> {
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(&self.path)
    }

    fn io_error(&self, e: std::io::Error) -> CertError {
        CertError::InternalStore(format!("audit log {}: {}", self.path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        let identity = Identity::new("example.com").unwrap();
        let op = OperationId::new();

        log.record(&AuditRecord::new(&identity, AuditEvent::Retry, &op).with_detail("attempt 1"))
            .unwrap();
        log.record(&AuditRecord::new(&identity, AuditEvent::Issued, &op))
            .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, AuditEvent::Retry);
        assert_eq!(records[0].detail.as_deref(), Some("attempt 1"));
        assert_eq!(records[1].event, AuditEvent::Issued);
        assert_eq!(records[1].operation, op);
    }

    #[test]
    fn test_error_records_kind() {
        let identity = Identity::new("example.com").unwrap();
        let err = CertError::PolicyViolation("too many names".into());
        let record =
            AuditRecord::new(&identity, AuditEvent::Rejected, &OperationId::new()).with_error(&err);
        assert_eq!(record.error_kind, Some(ErrorKind::PolicyViolation));

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"event\":\"rejected\""));
        assert!(json.contains("PolicyViolation"));
    }

    #[test]
    fn test_filters_by_identity_and_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.log"));
        let a = Identity::new("a.example.com").unwrap();
        let b = Identity::new("b.example.com").unwrap();
        let op = OperationId::new();

        log.record(&AuditRecord::new(&a, AuditEvent::Issued, &op)).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();
        log.record(&AuditRecord::new(&b, AuditEvent::Issued, &op)).unwrap();

        assert_eq!(log.read_all().unwrap().len(), 2);
        assert_eq!(log.for_identity(&b).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("absent.log"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
