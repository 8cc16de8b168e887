//! Append-only, tamper-evident audit trail of lock lifecycle events.
//!
//! Grounded on the teacher's JSONL event emitter: every write follows a
//! "never fail upward" contract — an audit I/O or serialization failure is
//! logged via `tracing::warn!` and swallowed, never propagated to the
//! caller. A lock manager that refused to acquire a lock because its audit
//! disk was full would be strictly worse than one that acquired the lock
//! and merely lost a log line.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditEventKind {
    #[serde(rename = "acquire")]
    Acquire,
    #[serde(rename = "deny")]
    Deny,
    #[serde(rename = "release")]
    Release,
    #[serde(rename = "force-break")]
    ForceBreak,
    #[serde(rename = "stale-break")]
    StaleBreak,
    #[serde(rename = "auto-prune")]
    AutoPrune,
    #[serde(rename = "corrupt-break")]
    CorruptBreak,
    #[serde(rename = "renew")]
    Renew,
    #[serde(rename = "freeze")]
    Freeze,
    #[serde(rename = "unfreeze")]
    Unfreeze,
    #[serde(rename = "force-unfreeze")]
    ForceUnfreeze,
    #[serde(rename = "freeze-deny")]
    FreezeDeny,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "event")]
    pub kind: AuditEventKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, name: &str) -> Self {
        AuditEvent {
            ts: Utc::now(),
            kind,
            name: name.to_string(),
            lock_id: None,
            owner: None,
            host: None,
            pid: None,
            agent_id: None,
            ttl_sec: None,
            detail: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_holder(mut self, lock_id: &str, owner: &str, host: &str, pid: u32) -> Self {
        self.lock_id = Some(lock_id.to_string());
        self.owner = Some(owner.to_string());
        self.host = Some(host.to_string());
        self.pid = Some(pid);
        self
    }

    pub fn with_agent_id(mut self, agent_id: Option<&str>) -> Self {
        self.agent_id = agent_id.map(|s| s.to_string());
        self
    }

    pub fn with_ttl(mut self, ttl_sec: u64) -> Self {
        self.ttl_sec = if ttl_sec > 0 { Some(ttl_sec) } else { None };
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.extra.insert(key.to_string(), v);
        }
        self
    }
}

/// A sink for audit events. `record` must never panic and never block the
/// caller on a slow or failed write beyond what normal file I/O costs.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Discards every event. Used when a caller opts out of the audit trail.
pub struct NullAuditor;

impl AuditSink for NullAuditor {
    fn record(&self, _event: &AuditEvent) {}
}

/// Appends one JSON object per line to `audit.jsonl` under the lock
/// manager's root. Writes are serialized through an internal mutex so
/// concurrent acquire/release calls from the same process interleave
/// cleanly; cross-process interleaving relies on the kernel's append-mode
/// write atomicity for lines under `PIPE_BUF`.
pub struct JsonlFileAuditor {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlFileAuditor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonlFileAuditor {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlFileAuditor {
    fn record(&self, event: &AuditEvent) {
        let _guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let line = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize audit event, dropping");
                return;
            }
        };

        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let result = opts.open(&self.path).and_then(|mut f| writeln!(f, "{line}"));

        if let Err(err) = result {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "failed to append audit event, dropping"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn records_are_appended_as_jsonl() {
        let dir = TempDir::new().unwrap();
        let auditor = JsonlFileAuditor::new(dir.path().join("audit.jsonl"));

        auditor.record(&AuditEvent::new(AuditEventKind::Acquire, "deploy").with_holder(
            "abc123",
            "alice",
            "host-a",
            42,
        ));
        auditor.record(&AuditEvent::new(AuditEventKind::Release, "deploy"));

        let contents = fs::read_to_string(auditor.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "acquire");
        assert_eq!(first["owner"], "alice");
    }

    #[test]
    fn agent_id_and_ttl_sec_are_emitted_when_present() {
        let dir = TempDir::new().unwrap();
        let auditor = JsonlFileAuditor::new(dir.path().join("audit.jsonl"));

        auditor.record(
            &AuditEvent::new(AuditEventKind::Acquire, "deploy")
                .with_holder("abc123", "alice", "host-a", 42)
                .with_agent_id(Some("agent-8f2c"))
                .with_ttl(300),
        );

        let contents = fs::read_to_string(auditor.path()).unwrap();
        let event: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(event["agent_id"], "agent-8f2c");
        assert_eq!(event["ttl_sec"], 300);
    }

    #[cfg(unix)]
    #[test]
    fn audit_file_is_created_mode_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let auditor = JsonlFileAuditor::new(dir.path().join("audit.jsonl"));
        auditor.record(&AuditEvent::new(AuditEventKind::Acquire, "deploy"));

        let mode = fs::metadata(auditor.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn null_auditor_discards_silently() {
        let auditor = NullAuditor;
        auditor.record(&AuditEvent::new(AuditEventKind::Deny, "deploy"));
    }

    #[test]
    fn missing_parent_directory_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let auditor = JsonlFileAuditor::new(dir.path().join("no-such-subdir").join("audit.jsonl"));
        auditor.record(&AuditEvent::new(AuditEventKind::Acquire, "deploy"));
    }
}
