//! The on-disk lock record and its codec: versioned JSON, atomic
//! temp-file-then-rename writes, and directory fsync for durable name
//! visibility. See `spec.md` §3.2, §4.A, §6.1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Highest lock-record format version this build understands.
pub const MAX_SUPPORTED_VERSION: u32 = 1;
/// Version stamped on every record this build writes.
pub const CURRENT_VERSION: u32 = 1;

/// A lock (or freeze) record as it exists on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    #[serde(default)]
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub lock_id: String,
    pub owner: String,
    pub host: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid_start_ns: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub acquired_ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ttl_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Read-only snapshot of a lock/freeze record, handed back to callers on
/// denial/ownership/staleness errors so they can inspect the holder without
/// being able to mutate anything.
#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub name: String,
    pub lock_id: String,
    pub owner: String,
    pub host: String,
    pub pid: u32,
    pub pid_start_ns: Option<i64>,
    pub agent_id: Option<String>,
    pub acquired_ts: DateTime<Utc>,
    pub ttl_sec: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<LockRecord> for LockInfo {
    fn from(r: LockRecord) -> Self {
        LockInfo {
            name: r.name,
            lock_id: r.lock_id,
            owner: r.owner,
            host: r.host,
            pid: r.pid,
            pid_start_ns: r.pid_start_ns,
            agent_id: r.agent_id,
            acquired_ts: r.acquired_ts,
            ttl_sec: r.ttl_sec,
            expires_at: r.expires_at,
        }
    }
}

impl From<&LockRecord> for LockInfo {
    fn from(r: &LockRecord) -> Self {
        r.clone().into()
    }
}

impl LockInfo {
    /// The synthetic holder used for the "another process is mid-write"
    /// case: only `name` is meaningful, everything else is zero-valued.
    /// Callers must tolerate a zero `owner`/`pid` on this variant.
    pub fn transient(name: &str) -> Self {
        LockInfo {
            name: name.to_string(),
            lock_id: String::new(),
            owner: String::new(),
            host: String::new(),
            pid: 0,
            pid_start_ns: None,
            agent_id: None,
            acquired_ts: Utc::now(),
            ttl_sec: 0,
            expires_at: None,
        }
    }
}

/// Distinguishes "not a valid record" from "another writer is mid-write".
pub enum ReadOutcome {
    Valid(LockRecord),
    Empty,
}

/// Errors from the codec layer, before they are given path/name context and
/// folded into [`crate::error::LockError`] by callers.
#[derive(Debug)]
pub enum CodecError {
    Io(io::Error),
    Corrupted(serde_json::Error),
    UnsupportedVersion(u32),
}

/// Read and parse a lock/freeze file.
///
/// An empty file is reported as [`ReadOutcome::Empty`], not corruption —
/// another writer is mid-placeholder-create. Unknown-version records are
/// rejected before a full struct decode is attempted, so an unsupported
/// future format never gets silently misparsed.
pub fn read(path: &Path) -> Result<ReadOutcome, CodecError> {
    let bytes = fs::read(path).map_err(CodecError::Io)?;
    if bytes.is_empty() {
        return Ok(ReadOutcome::Empty);
    }
    let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(CodecError::Corrupted)?;
    let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    if version > MAX_SUPPORTED_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let record: LockRecord = serde_json::from_value(value).map_err(CodecError::Corrupted)?;
    Ok(ReadOutcome::Valid(record))
}

/// Atomically (re)write a lock record: serialize with `version` emitted
/// first (guaranteed by field declaration order), write a sibling temp
/// file, fsync it, rename it over the target, then fsync the parent
/// directory so the rename itself is durable.
pub fn write_atomic(path: &Path, record: &LockRecord) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "lock path has no parent"))?;

    let mut json = serde_json::to_string_pretty(record)?;
    json.push('\n');

    let tmp_path = dir.join(format!(".lock-{}.tmp", generate_lock_id()));
    let result = write_and_rename(&tmp_path, path, dir, json.as_bytes());
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_and_rename(tmp_path: &Path, target: &Path, dir: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = create_tmp_file(tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp_path, target)?;
    fsync_dir(dir)
}

fn create_tmp_file(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
}

/// Create the lock/freeze placeholder via exclusive create, mode 0600.
pub fn create_placeholder(path: &Path) -> io::Result<()> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)?;
    Ok(())
}

/// Fsync a directory so that a prior create/rename/remove within it is
/// durable. A no-op on platforms without directory-handle fsync support.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let f = File::open(dir)?;
        f.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// 16 cryptographically random bytes, hex-encoded. Falls back to a
/// monotonic-nanosecond encoding if the entropy source is unavailable.
pub fn generate_lock_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    let mut rng = rand::rngs::OsRng;
    match rng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex_encode(&bytes),
        Err(_) => hex_encode(&monotonic_nanos_bytes()),
    }
}

fn monotonic_nanos_bytes() -> [u8; 16] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut out = [0u8; 16];
    out.copy_from_slice(&nanos.to_be_bytes());
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record(name: &str) -> LockRecord {
        LockRecord {
            version: CURRENT_VERSION,
            name: name.to_string(),
            lock_id: generate_lock_id(),
            owner: "alice".to_string(),
            host: "host-a".to_string(),
            pid: 4212,
            pid_start_ns: Some(1_706_400_000_000_000_000),
            agent_id: Some("agent-8f2c".to_string()),
            acquired_ts: Utc::now(),
            ttl_sec: 300,
            expires_at: Some(Utc::now() + chrono::Duration::seconds(300)),
        }
    }

    #[test]
    fn round_trip_preserves_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.json");
        let record = sample_record("deploy");
        write_atomic(&path, &record).unwrap();

        match read(&path).unwrap() {
            ReadOutcome::Valid(r) => {
                assert_eq!(r.name, record.name);
                assert_eq!(r.lock_id, record.lock_id);
                assert_eq!(r.owner, record.owner);
                assert_eq!(r.pid, record.pid);
                assert_eq!(r.ttl_sec, record.ttl_sec);
            }
            ReadOutcome::Empty => panic!("expected a valid record"),
        }
    }

    #[test]
    fn version_is_first_field_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.json");
        write_atomic(&path, &sample_record("deploy")).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        let first_key_line = contents.lines().nth(1).unwrap();
        assert!(first_key_line.contains("\"version\""));
    }

    #[test]
    fn empty_file_is_reported_as_transient_not_corrupted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.json");
        fs::write(&path, b"").unwrap();
        match read(&path) {
            Ok(ReadOutcome::Empty) => {}
            other => panic!("expected Empty, got {other:?}"),
        }
    }

    impl std::fmt::Debug for ReadOutcome {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                ReadOutcome::Valid(r) => write!(f, "Valid({})", r.name),
                ReadOutcome::Empty => write!(f, "Empty"),
            }
        }
    }

    #[test]
    fn garbage_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.json");
        fs::write(&path, b"not json").unwrap();
        match read(&path) {
            Err(CodecError::Corrupted(_)) => {}
            other => panic!("expected Corrupted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn missing_version_defaults_to_zero_and_is_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.json");
        let legacy = serde_json::json!({
            "name": "legacy",
            "owner": "bob",
            "host": "host-b",
            "pid": 123,
            "acquired_ts": Utc::now().to_rfc3339(),
        });
        fs::write(&path, legacy.to_string()).unwrap();
        match read(&path).unwrap() {
            ReadOutcome::Valid(r) => {
                assert_eq!(r.version, 0);
                assert_eq!(r.lock_id, "");
                assert!(r.pid_start_ns.is_none());
            }
            ReadOutcome::Empty => panic!("expected a valid legacy record"),
        }
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("future.json");
        let future = serde_json::json!({
            "version": 99,
            "name": "future",
            "owner": "bob",
            "host": "host-b",
            "pid": 123,
            "acquired_ts": Utc::now().to_rfc3339(),
        });
        fs::write(&path, future.to_string()).unwrap();
        match read(&path) {
            Err(CodecError::UnsupportedVersion(99)) => {}
            other => panic!("expected UnsupportedVersion(99), got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn lock_id_is_32_hex_chars() {
        let id = generate_lock_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn create_placeholder_fails_if_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deploy.json");
        create_placeholder(&path).unwrap();
        let err = create_placeholder(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
