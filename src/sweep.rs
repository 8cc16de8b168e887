//! Opportunistic sweep (component I): a batched, best-effort scan of
//! `locks/` and `freezes/` that removes definitively-stale entries.
//!
//! Conservative by design — same-host entries require proof (dead PID or
//! PID recycling) in addition to TTL expiry; cross-host entries may be
//! swept on TTL expiry alone, since a remote PID can't be verified at all.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::identity::local_host;
use crate::liveness;
use crate::lockfile::{self, CodecError, ReadOutcome};
use crate::paths;

fn emit(auditor: Option<&dyn AuditSink>, event: AuditEvent) {
    if let Some(sink) = auditor {
        sink.record(&event);
    }
}

fn remove_and_fsync(path: &Path) -> io::Result<()> {
    fs::remove_file(path)?;
    if let Some(dir) = path.parent() {
        lockfile::fsync_dir(dir)?;
    }
    Ok(())
}

/// One failed removal during a sweep pass, collected rather than aborting
/// the scan.
#[derive(Debug)]
pub struct SweepError {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Scan `locks/` and `freezes/` under `root`, removing every entry this
/// sweep can conservatively prove is stale. Returns the count removed and
/// any per-file errors encountered along the way; a missing directory is
/// not an error.
pub fn prune_all_expired(root: &Path, auditor: Option<&dyn AuditSink>) -> (usize, Vec<SweepError>) {
    let mut pruned = 0usize;
    let mut errors = Vec::new();

    for dir in [paths::locks_dir(root), paths::freezes_dir(root)] {
        sweep_dir(&dir, auditor, &mut pruned, &mut errors);
    }

    (pruned, errors)
}

fn sweep_dir(dir: &Path, auditor: Option<&dyn AuditSink>, pruned: &mut usize, errors: &mut Vec<SweepError>) {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            errors.push(SweepError {
                path: dir.to_path_buf(),
                source: e,
            });
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        match lockfile::read(&path) {
            Ok(ReadOutcome::Valid(record)) => {
                if let Some(reason) = sweep_reason(&record) {
                    if let Err(e) = remove_and_fsync(&path) {
                        errors.push(SweepError { path, source: e });
                        continue;
                    }
                    emit(
                        auditor,
                        AuditEvent::new(AuditEventKind::AutoPrune, &record.name)
                            .with_holder(&record.lock_id, &record.owner, &record.host, record.pid)
                            .with_agent_id(record.agent_id.as_deref())
                            .with_ttl(record.ttl_sec)
                            .with_extra("sweep_reason", reason),
                    );
                    *pruned += 1;
                }
            }
            Ok(ReadOutcome::Empty) => {
                // Another writer is mid-placeholder-create; never sweep this.
            }
            Err(CodecError::Corrupted(_)) => {
                if let Err(e) = remove_and_fsync(&path) {
                    errors.push(SweepError { path, source: e });
                    continue;
                }
                emit(
                    auditor,
                    AuditEvent::new(AuditEventKind::AutoPrune, &path_stem(&path))
                        .with_extra("sweep_reason", "corrupted"),
                );
                *pruned += 1;
            }
            Err(CodecError::UnsupportedVersion(_)) => {
                // Fail-safe: an unsupported future format is left alone.
            }
            Err(CodecError::Io(e)) => {
                errors.push(SweepError { path, source: e });
            }
        }
    }
}

fn path_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string()
}

/// `Some(reason)` if `record` is eligible for sweep, `None` otherwise.
/// Expired TTL is a *necessary* condition; same-host entries additionally
/// require dead-PID or PID-recycling proof.
fn sweep_reason(record: &crate::lockfile::LockRecord) -> Option<&'static str> {
    if record.ttl_sec == 0 {
        return None;
    }
    let age = Utc::now().signed_duration_since(record.acquired_ts);
    if age.num_seconds() <= record.ttl_sec as i64 {
        return None;
    }

    if record.host == local_host() {
        if !liveness::is_alive(record.pid) {
            return Some("expired+dead_pid");
        }
        match record.pid_start_ns {
            Some(recorded) if recorded != 0 => match liveness::process_start(record.pid) {
                Some(current) if current != recorded => Some("expired+dead_pid"),
                _ => None,
            },
            _ => None,
        }
    } else {
        Some("expired")
    }
}
