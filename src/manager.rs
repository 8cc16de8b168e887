//! Acquire / release / renew / release-by-owner (component G): the core
//! lock state machine built on top of the codec (A), identity (C), and
//! staleness decision (E).

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;

use crate::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::error::LockError;
use crate::identity::{Identity, IdentityOverrides};
use crate::lockfile::{self, CodecError, LockInfo, LockRecord, ReadOutcome, CURRENT_VERSION};
use crate::name;
use crate::paths;
use crate::staleness::{self, StaleReason};

const MAX_ACQUIRE_RETRIES: u32 = 8;

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

fn ttl_sec(ttl: Duration) -> u64 {
    ttl.as_secs()
}

fn build_record(name: &str, identity: &Identity, lock_id: String, ttl: Duration) -> LockRecord {
    let now = Utc::now();
    let secs = ttl_sec(ttl);
    LockRecord {
        version: CURRENT_VERSION,
        name: name.to_string(),
        lock_id,
        owner: identity.owner.clone(),
        host: identity.host.clone(),
        pid: identity.pid,
        pid_start_ns: identity.pid_start_ns,
        agent_id: Some(identity.agent_id.clone()),
        acquired_ts: now,
        ttl_sec: secs,
        expires_at: if secs > 0 {
            Some(now + chrono::Duration::seconds(secs as i64))
        } else {
            None
        },
    }
}

fn refresh_record(existing: &LockRecord, identity: &Identity, ttl: Duration) -> LockRecord {
    let mut refreshed = build_record(&existing.name, identity, existing.lock_id.clone(), ttl);
    // Reentrant refresh only touches acquired_ts/ttl_sec/expires_at and the
    // current identity fields; lock_id is preserved above.
    refreshed.name = existing.name.clone();
    refreshed
}

/// Options for [`acquire`].
#[derive(Default)]
pub struct AcquireOptions<'a> {
    pub ttl: Duration,
    pub identity: IdentityOverrides,
    pub auditor: Option<&'a dyn AuditSink>,
}

/// Options for [`release`].
#[derive(Default)]
pub struct ReleaseOptions<'a> {
    pub force: bool,
    pub break_stale: bool,
    pub identity: IdentityOverrides,
    pub auditor: Option<&'a dyn AuditSink>,
}

/// Options for [`renew`].
#[derive(Default)]
pub struct RenewOptions<'a> {
    pub ttl: Option<Duration>,
    pub identity: IdentityOverrides,
    pub auditor: Option<&'a dyn AuditSink>,
}

/// Non-blocking acquire. See `acquire_with_wait` (component J) for a
/// blocking variant that retries across a backoff schedule.
pub fn acquire(root: &Path, name_str: &str, opts: &AcquireOptions) -> Result<(), LockError> {
    name::validate(name_str)?;
    paths::ensure_dirs(root).map_err(|e| LockError::io(name_str, root, e))?;

    let path = paths::lock_path(root, name_str);
    let current = Identity::current(&opts.identity);
    let auditor = opts.auditor;

    for _ in 0..MAX_ACQUIRE_RETRIES {
        match lockfile::create_placeholder(&path) {
            Ok(()) => {
                let record = build_record(name_str, &current, lockfile::generate_lock_id(), opts.ttl);
                if let Err(err) = lockfile::write_atomic(&path, &record) {
                    let _ = fs::remove_file(&path);
                    return Err(LockError::io(name_str, &path, err));
                }
                emit(
                    auditor,
                    AuditEvent::new(AuditEventKind::Acquire, name_str)
                        .with_holder(&record.lock_id, &record.owner, &record.host, record.pid)
                        .with_agent_id(record.agent_id.as_deref())
                        .with_ttl(record.ttl_sec),
                );
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                match lockfile::read(&path) {
                    Ok(ReadOutcome::Valid(existing)) => {
                        if existing.owner == current.owner {
                            let refreshed = refresh_record(&existing, &current, opts.ttl);
                            lockfile::write_atomic(&path, &refreshed)
                                .map_err(|e| LockError::io(name_str, &path, e))?;
                            emit(
                                auditor,
                                AuditEvent::new(AuditEventKind::Renew, name_str)
                                    .with_holder(&refreshed.lock_id, &refreshed.owner, &refreshed.host, refreshed.pid)
                                    .with_agent_id(refreshed.agent_id.as_deref())
                                    .with_ttl(refreshed.ttl_sec),
                            );
                            return Ok(());
                        }

                        let verdict = staleness::decide(&existing);
                        if verdict.stale && verdict.reason == StaleReason::DeadPid {
                            remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
                            emit(
                                auditor,
                                AuditEvent::new(AuditEventKind::AutoPrune, name_str)
                                    .with_holder(
                                        &existing.lock_id,
                                        &existing.owner,
                                        &existing.host,
                                        existing.pid,
                                    )
                                    .with_agent_id(existing.agent_id.as_deref())
                                    .with_ttl(existing.ttl_sec)
                                    .with_extra("pruned_pid", existing.pid),
                            );
                            continue;
                        }

                        emit(
                            auditor,
                            AuditEvent::new(AuditEventKind::Deny, name_str)
                                .with_holder(&existing.lock_id, &existing.owner, &existing.host, existing.pid)
                                .with_agent_id(existing.agent_id.as_deref())
                                .with_ttl(existing.ttl_sec),
                        );
                        return Err(LockError::Held {
                            name: name_str.to_string(),
                            holder: Box::new(existing.into()),
                        });
                    }
                    Ok(ReadOutcome::Empty) => {
                        return Err(LockError::Held {
                            name: name_str.to_string(),
                            holder: Box::new(LockInfo::transient(name_str)),
                        });
                    }
                    Err(CodecError::Corrupted(_)) => {
                        remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
                        emit(auditor, AuditEvent::new(AuditEventKind::CorruptBreak, name_str));
                        continue;
                    }
                    Err(CodecError::UnsupportedVersion(version)) => {
                        return Err(LockError::UnsupportedVersion {
                            name: name_str.to_string(),
                            path,
                            version,
                        });
                    }
                    Err(CodecError::Io(e)) => return Err(LockError::io(name_str, &path, e)),
                }
            }
            Err(err) => return Err(LockError::io(name_str, &path, err)),
        }
    }

    Err(LockError::io(
        name_str,
        &path,
        io::Error::other("exceeded acquire retry budget"),
    ))
}

/// Release. `opts.force` skips ownership/staleness checks entirely;
/// `opts.break_stale` removes the lock only if the staleness decision
/// deems it so; the default mode requires the caller to be the owner.
pub fn release(root: &Path, name_str: &str, opts: &ReleaseOptions) -> Result<(), LockError> {
    name::validate(name_str)?;
    let path = paths::lock_path(root, name_str);
    let current = Identity::current(&opts.identity);
    let auditor = opts.auditor;

    let existing = match lockfile::read(&path) {
        Ok(ReadOutcome::Valid(r)) => r,
        Ok(ReadOutcome::Empty) => {
            if opts.force || opts.break_stale {
                remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
                emit(
                    auditor,
                    AuditEvent::new(
                        if opts.force {
                            AuditEventKind::ForceBreak
                        } else {
                            AuditEventKind::StaleBreak
                        },
                        name_str,
                    ),
                );
                return Ok(());
            }
            return Err(LockError::NotFound {
                name: name_str.to_string(),
            });
        }
        Err(CodecError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            return Err(LockError::NotFound {
                name: name_str.to_string(),
            });
        }
        Err(CodecError::Io(e)) => return Err(LockError::io(name_str, &path, e)),
        Err(CodecError::Corrupted(source)) => {
            if opts.force || opts.break_stale {
                remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
                emit(auditor, AuditEvent::new(AuditEventKind::CorruptBreak, name_str));
                return Ok(());
            }
            return Err(LockError::Corrupted {
                name: name_str.to_string(),
                path,
                source,
            });
        }
        Err(CodecError::UnsupportedVersion(version)) => {
            if opts.force {
                remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
                emit(auditor, AuditEvent::new(AuditEventKind::ForceBreak, name_str));
                return Ok(());
            }
            return Err(LockError::UnsupportedVersion {
                name: name_str.to_string(),
                path,
                version,
            });
        }
    };

    let event_kind = if opts.force {
        AuditEventKind::ForceBreak
    } else if opts.break_stale {
        let verdict = staleness::decide(&existing);
        if !verdict.stale {
            return Err(LockError::NotStale {
                name: name_str.to_string(),
                existing: Box::new(existing.into()),
                reason: verdict.reason,
            });
        }
        AuditEventKind::StaleBreak
    } else {
        if existing.owner != current.owner {
            return Err(LockError::NotOwner {
                name: name_str.to_string(),
                existing: Box::new(existing.into()),
            });
        }
        AuditEventKind::Release
    };

    remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
    emit(
        auditor,
        AuditEvent::new(event_kind, name_str)
            .with_holder(&existing.lock_id, &existing.owner, &existing.host, existing.pid)
            .with_agent_id(existing.agent_id.as_deref())
            .with_ttl(existing.ttl_sec),
    );
    Ok(())
}

/// Renew a lock this process already holds: same owner/host/pid tuple,
/// fresh `acquired_ts`/`expires_at`, same `lock_id`. `opts.ttl`, when
/// `None`, preserves the existing TTL.
pub fn renew(root: &Path, name_str: &str, opts: &RenewOptions) -> Result<(), LockError> {
    name::validate(name_str)?;
    let path = paths::lock_path(root, name_str);
    let current = Identity::current(&opts.identity);
    let auditor = opts.auditor;

    let existing = match lockfile::read(&path) {
        Ok(ReadOutcome::Valid(r)) => r,
        Ok(ReadOutcome::Empty) => {
            return Err(LockError::NotFound {
                name: name_str.to_string(),
            });
        }
        Err(CodecError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            return Err(LockError::NotFound {
                name: name_str.to_string(),
            });
        }
        Err(CodecError::Io(e)) => return Err(LockError::io(name_str, &path, e)),
        Err(CodecError::Corrupted(source)) => {
            return Err(LockError::Corrupted {
                name: name_str.to_string(),
                path,
                source,
            });
        }
        Err(CodecError::UnsupportedVersion(version)) => {
            return Err(LockError::UnsupportedVersion {
                name: name_str.to_string(),
                path,
                version,
            });
        }
    };

    if existing.owner != current.owner || existing.host != current.host || existing.pid != current.pid {
        return Err(LockError::LockStolen {
            name: name_str.to_string(),
        });
    }

    let ttl = opts.ttl.unwrap_or(Duration::from_secs(existing.ttl_sec));
    let refreshed = refresh_record(&existing, &current, ttl);
    lockfile::write_atomic(&path, &refreshed).map_err(|e| LockError::io(name_str, &path, e))?;
    emit(
        auditor,
        AuditEvent::new(AuditEventKind::Renew, name_str)
            .with_holder(&refreshed.lock_id, &refreshed.owner, &refreshed.host, refreshed.pid)
            .with_agent_id(refreshed.agent_id.as_deref())
            .with_ttl(refreshed.ttl_sec),
    );
    Ok(())
}

/// Release every lock in `locks/` owned by `owner`. Unreadable or
/// corrupted entries are skipped, not returned as errors — this is a
/// best-effort sweep of one owner's locks, not a transactional operation.
pub fn release_by_owner(
    root: &Path,
    owner: &str,
    auditor: Option<&dyn AuditSink>,
) -> Result<Vec<String>, LockError> {
    let dir = paths::locks_dir(root);
    let entries = match fs::read_dir(&dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LockError::io(owner, &dir, e)),
    };

    let mut released = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let record = match lockfile::read(&path) {
            Ok(ReadOutcome::Valid(r)) => r,
            Ok(ReadOutcome::Empty) => continue,
            Err(_) => {
                tracing::warn!(path = %path.display(), "skipping unreadable lock during release_by_owner scan");
                continue;
            }
        };
        if record.owner != owner {
            continue;
        }
        if let Err(e) = remove_and_fsync(&path) {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove lock during release_by_owner");
            continue;
        }
        emit(
            auditor,
            AuditEvent::new(AuditEventKind::Release, &record.name)
                .with_holder(&record.lock_id, &record.owner, &record.host, record.pid)
                .with_agent_id(record.agent_id.as_deref())
                .with_ttl(record.ttl_sec),
        );
        released.push(record.name);
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{JsonlFileAuditor, NullAuditor};
    use tempfile::TempDir;

    fn identity_override(owner: &str) -> IdentityOverrides {
        IdentityOverrides {
            owner: Some(owner.to_string()),
            agent_id: None,
        }
    }

    #[test]
    fn acquire_then_release_round_trips() {
        let root = TempDir::new().unwrap();
        let opts = AcquireOptions {
            ttl: Duration::from_secs(300),
            identity: identity_override("alice"),
            auditor: None,
        };
        acquire(root.path(), "deploy", &opts).unwrap();
        assert!(paths::lock_path(root.path(), "deploy").exists());

        let release_opts = ReleaseOptions {
            identity: identity_override("alice"),
            ..Default::default()
        };
        release(root.path(), "deploy", &release_opts).unwrap();
        assert!(!paths::lock_path(root.path(), "deploy").exists());
    }

    #[test]
    fn reentrant_acquire_refreshes_and_preserves_lock_id() {
        let root = TempDir::new().unwrap();
        let opts = AcquireOptions {
            ttl: Duration::from_secs(60),
            identity: identity_override("alice"),
            auditor: None,
        };
        acquire(root.path(), "deploy", &opts).unwrap();
        let path = paths::lock_path(root.path(), "deploy");
        let first = match lockfile::read(&path).unwrap() {
            ReadOutcome::Valid(r) => r,
            ReadOutcome::Empty => panic!("expected a record"),
        };

        acquire(root.path(), "deploy", &opts).unwrap();
        let second = match lockfile::read(&path).unwrap() {
            ReadOutcome::Valid(r) => r,
            ReadOutcome::Empty => panic!("expected a record"),
        };

        assert_eq!(first.lock_id, second.lock_id);
        assert!(second.acquired_ts >= first.acquired_ts);
    }

    #[test]
    fn acquire_by_different_owner_is_denied() {
        let root = TempDir::new().unwrap();
        let opts_a = AcquireOptions {
            identity: identity_override("alice"),
            ..Default::default()
        };
        acquire(root.path(), "deploy", &opts_a).unwrap();

        let opts_b = AcquireOptions {
            identity: identity_override("bob"),
            ..Default::default()
        };
        let err = acquire(root.path(), "deploy", &opts_b).unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
    }

    #[test]
    fn release_by_non_owner_without_force_is_denied() {
        let root = TempDir::new().unwrap();
        let opts_a = AcquireOptions {
            identity: identity_override("alice"),
            ..Default::default()
        };
        acquire(root.path(), "deploy", &opts_a).unwrap();

        let release_opts = ReleaseOptions {
            identity: identity_override("bob"),
            ..Default::default()
        };
        let err = release(root.path(), "deploy", &release_opts).unwrap_err();
        assert!(matches!(err, LockError::NotOwner { .. }));
    }

    #[test]
    fn release_of_nonexistent_lock_is_not_found() {
        let root = TempDir::new().unwrap();
        paths::ensure_dirs(root.path()).unwrap();
        let err = release(root.path(), "ghost", &ReleaseOptions::default()).unwrap_err();
        assert!(matches!(err, LockError::NotFound { .. }));
    }

    #[test]
    fn dead_pid_holder_is_auto_pruned_on_acquire() {
        let root = TempDir::new().unwrap();
        paths::ensure_dirs(root.path()).unwrap();
        let path = paths::lock_path(root.path(), "x");
        let stale = LockRecord {
            version: CURRENT_VERSION,
            name: "x".to_string(),
            lock_id: "deadbeef".to_string(),
            owner: "ghost-owner".to_string(),
            host: crate::identity::local_host(),
            pid: 999_999,
            pid_start_ns: None,
            agent_id: None,
            acquired_ts: Utc::now(),
            ttl_sec: 0,
            expires_at: None,
        };
        lockfile::create_placeholder(&path).unwrap();
        lockfile::write_atomic(&path, &stale).unwrap();

        let auditor = JsonlFileAuditor::new(paths::audit_path(root.path()));
        let opts = AcquireOptions {
            identity: identity_override("alice"),
            auditor: Some(&auditor),
            ..Default::default()
        };
        acquire(root.path(), "x", &opts).unwrap();

        let contents = fs::read_to_string(auditor.path()).unwrap();
        let kinds: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(kinds[0]["event"], "auto-prune");
        assert_eq!(kinds[0]["pruned_pid"], 999999);
        assert_eq!(kinds[1]["event"], "acquire");
    }

    #[test]
    fn expired_ttl_same_host_live_pid_is_not_auto_pruned() {
        let root = TempDir::new().unwrap();
        paths::ensure_dirs(root.path()).unwrap();
        let path = paths::lock_path(root.path(), "x");
        let expired = LockRecord {
            version: CURRENT_VERSION,
            name: "x".to_string(),
            lock_id: "aaaa".to_string(),
            owner: "alice".to_string(),
            host: crate::identity::local_host(),
            pid: std::process::id(),
            pid_start_ns: None,
            agent_id: None,
            acquired_ts: Utc::now() - chrono::Duration::seconds(10),
            ttl_sec: 1,
            expires_at: None,
        };
        lockfile::create_placeholder(&path).unwrap();
        lockfile::write_atomic(&path, &expired).unwrap();

        let opts = AcquireOptions {
            identity: identity_override("bob"),
            ..Default::default()
        };
        let err = acquire(root.path(), "x", &opts).unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
    }

    #[test]
    fn corrupted_release_with_break_stale_removes_and_allows_reacquire() {
        let root = TempDir::new().unwrap();
        paths::ensure_dirs(root.path()).unwrap();
        let path = paths::lock_path(root.path(), "c");
        fs::write(&path, b"garbage").unwrap();

        let release_opts = ReleaseOptions {
            break_stale: true,
            ..Default::default()
        };
        release(root.path(), "c", &release_opts).unwrap();
        assert!(!path.exists());

        acquire(root.path(), "c", &AcquireOptions::default()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn renew_preserves_lock_id_and_bumps_timestamp() {
        let root = TempDir::new().unwrap();
        let opts = AcquireOptions {
            ttl: Duration::from_secs(60),
            identity: identity_override("alice"),
            ..Default::default()
        };
        acquire(root.path(), "deploy", &opts).unwrap();
        let path = paths::lock_path(root.path(), "deploy");
        let before = match lockfile::read(&path).unwrap() {
            ReadOutcome::Valid(r) => r,
            ReadOutcome::Empty => panic!(),
        };

        std::thread::sleep(Duration::from_millis(5));
        renew(
            root.path(),
            "deploy",
            &RenewOptions {
                identity: identity_override("alice"),
                ..Default::default()
            },
        )
        .unwrap();

        let after = match lockfile::read(&path).unwrap() {
            ReadOutcome::Valid(r) => r,
            ReadOutcome::Empty => panic!(),
        };
        assert_eq!(before.lock_id, after.lock_id);
        assert!(after.acquired_ts > before.acquired_ts);
    }

    #[test]
    fn release_by_owner_removes_only_matching_locks() {
        let root = TempDir::new().unwrap();
        acquire(
            root.path(),
            "a",
            &AcquireOptions {
                identity: identity_override("alice"),
                ..Default::default()
            },
        )
        .unwrap();
        acquire(
            root.path(),
            "b",
            &AcquireOptions {
                identity: identity_override("bob"),
                ..Default::default()
            },
        )
        .unwrap();

        let released = release_by_owner(root.path(), "alice", None).unwrap();
        assert_eq!(released, vec!["a".to_string()]);
        assert!(!paths::lock_path(root.path(), "a").exists());
        assert!(paths::lock_path(root.path(), "b").exists());
    }

    #[test]
    fn audit_failure_does_not_block_acquire() {
        let root = TempDir::new().unwrap();
        let _ = NullAuditor; // sanity: NullAuditor constructs without a backing file
        let broken_auditor = JsonlFileAuditor::new(root.path().join("missing-dir").join("audit.jsonl"));
        let opts = AcquireOptions {
            identity: identity_override("alice"),
            auditor: Some(&broken_auditor),
            ..Default::default()
        };
        acquire(root.path(), "deploy", &opts).unwrap();
    }
}
