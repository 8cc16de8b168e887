//! Freeze guard (component H): a second, structurally-identical lock
//! namespace under `freezes/<name>.json` used to block a protected
//! operation without taking the lock itself. A freeze always requires a
//! positive TTL — unlike an ordinary lock, nothing else proves a freeze's
//! creator is still around, so it must expire on its own.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::error::LockError;
use crate::identity::{Identity, IdentityOverrides};
use crate::lockfile::{self, CodecError, LockRecord, ReadOutcome, CURRENT_VERSION};
use crate::name;
use crate::paths;
use crate::staleness::{self, StaleReason};

const MAX_FREEZE_RETRIES: u32 = 4;

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

/// Either `freezes/<name>.json` if present, otherwise the legacy
/// `locks/freeze-<name>.json` fallback.
fn resolve_freeze_path(root: &Path, name_str: &str) -> PathBuf {
    let current = paths::freeze_path(root, name_str);
    if current.exists() {
        return current;
    }
    let legacy = paths::legacy_freeze_path(root, name_str);
    if legacy.exists() {
        return legacy;
    }
    current
}

#[derive(Default)]
pub struct FreezeOptions<'a> {
    pub ttl: Duration,
    pub identity: IdentityOverrides,
    pub auditor: Option<&'a dyn AuditSink>,
}

#[derive(Default)]
pub struct UnfreezeOptions<'a> {
    pub force: bool,
    pub identity: IdentityOverrides,
    pub auditor: Option<&'a dyn AuditSink>,
}

/// Create a freeze. Requires a positive `ttl`.
pub fn freeze(root: &Path, name_str: &str, opts: &FreezeOptions) -> Result<(), LockError> {
    name::validate(name_str)?;
    if opts.ttl.is_zero() {
        return Err(LockError::FreezeRequiresTtl {
            name: name_str.to_string(),
        });
    }
    paths::ensure_dirs(root).map_err(|e| LockError::io(name_str, root, e))?;

    let path = paths::freeze_path(root, name_str);
    let current = Identity::current(&opts.identity);
    let auditor = opts.auditor;

    for _ in 0..MAX_FREEZE_RETRIES {
        match lockfile::create_placeholder(&path) {
            Ok(()) => {
                let record = build_freeze_record(name_str, &current, opts.ttl);
                if let Err(err) = lockfile::write_atomic(&path, &record) {
                    let _ = fs::remove_file(&path);
                    return Err(LockError::io(name_str, &path, err));
                }
                emit(
                    auditor,
                    AuditEvent::new(AuditEventKind::Freeze, name_str)
                        .with_holder(&record.lock_id, &record.owner, &record.host, record.pid)
                        .with_agent_id(record.agent_id.as_deref())
                        .with_ttl(record.ttl_sec),
                );
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => match lockfile::read(&path) {
                Ok(ReadOutcome::Valid(existing)) => {
                    // A freeze is meant to outlive its creating process, so only
                    // an expired TTL — never a same-host dead PID — clears it here.
                    let verdict = staleness::decide(&existing);
                    if verdict.stale && verdict.reason == StaleReason::Expired {
                        remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
                        continue;
                    }
                    return Err(LockError::Frozen {
                        name: name_str.to_string(),
                        freeze: Box::new(existing.into()),
                    });
                }
                Ok(ReadOutcome::Empty) => {
                    return Err(LockError::Frozen {
                        name: name_str.to_string(),
                        freeze: Box::new(crate::lockfile::LockInfo::transient(name_str)),
                    });
                }
                Err(CodecError::Corrupted(_)) => {
                    remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
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
            },
            Err(err) => return Err(LockError::io(name_str, &path, err)),
        }
    }

    Err(LockError::io(
        name_str,
        &path,
        io::Error::other("exceeded freeze retry budget"),
    ))
}

fn build_freeze_record(name_str: &str, identity: &Identity, ttl: Duration) -> LockRecord {
    let now = Utc::now();
    let secs = ttl.as_secs().max(1);
    LockRecord {
        version: CURRENT_VERSION,
        name: name_str.to_string(),
        lock_id: lockfile::generate_lock_id(),
        owner: identity.owner.clone(),
        host: identity.host.clone(),
        pid: identity.pid,
        pid_start_ns: identity.pid_start_ns,
        agent_id: Some(identity.agent_id.clone()),
        acquired_ts: now,
        ttl_sec: secs,
        expires_at: Some(now + chrono::Duration::seconds(secs as i64)),
    }
}

/// Strip a legacy `freeze-` filename prefix so audit events always report
/// the clean lock name, regardless of which path resolved the freeze.
fn clean_name(name_str: &str) -> &str {
    name_str.strip_prefix("freeze-").unwrap_or(name_str)
}

pub fn unfreeze(root: &Path, name_str: &str, opts: &UnfreezeOptions) -> Result<(), LockError> {
    name::validate(name_str)?;
    let path = resolve_freeze_path(root, name_str);
    let current = Identity::current(&opts.identity);
    let auditor = opts.auditor;
    let audit_name = clean_name(name_str);

    let existing = match lockfile::read(&path) {
        Ok(ReadOutcome::Valid(r)) => r,
        Ok(ReadOutcome::Empty) => {
            if opts.force {
                remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
                emit(auditor, AuditEvent::new(AuditEventKind::ForceUnfreeze, audit_name));
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
            if opts.force {
                remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
                emit(auditor, AuditEvent::new(AuditEventKind::ForceUnfreeze, audit_name));
                return Ok(());
            }
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

    if !opts.force && existing.owner != current.owner {
        return Err(LockError::NotOwner {
            name: name_str.to_string(),
            existing: Box::new(existing.into()),
        });
    }

    remove_and_fsync(&path).map_err(|e| LockError::io(name_str, &path, e))?;
    let kind = if opts.force {
        AuditEventKind::ForceUnfreeze
    } else {
        AuditEventKind::Unfreeze
    };
    emit(
        auditor,
        AuditEvent::new(kind, audit_name)
            .with_holder(&existing.lock_id, &existing.owner, &existing.host, existing.pid)
            .with_agent_id(existing.agent_id.as_deref())
            .with_ttl(existing.ttl_sec),
    );
    Ok(())
}

/// Check whether `name` is frozen. `Ok(())` means unguarded; `Err(Frozen)`
/// means the caller must not proceed with the protected operation.
///
/// Dead-PID holders are **not** pruned here — a freeze is meant to outlive
/// the process that created it. Only TTL expiry and explicit unfreeze
/// remove a freeze.
pub fn check_freeze(
    root: &Path,
    name_str: &str,
    auditor: Option<&dyn AuditSink>,
) -> Result<(), LockError> {
    name::validate(name_str)?;
    let path = resolve_freeze_path(root, name_str);

    let existing = match lockfile::read(&path) {
        Ok(ReadOutcome::Valid(r)) => r,
        Ok(ReadOutcome::Empty) => return Ok(()),
        Err(CodecError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(CodecError::Io(e)) => return Err(LockError::io(name_str, &path, e)),
        Err(CodecError::Corrupted(_)) => {
            let _ = remove_and_fsync(&path);
            return Ok(());
        }
        Err(CodecError::UnsupportedVersion(version)) => {
            return Err(LockError::UnsupportedVersion {
                name: name_str.to_string(),
                path,
                version,
            });
        }
    };

    // A dead-PID verdict must fall through to the deny below: a freeze
    // outlives its creating process by design, so only expiry clears it.
    let verdict = staleness::decide(&existing);
    if verdict.stale && verdict.reason == StaleReason::Expired {
        let _ = remove_and_fsync(&path);
        return Ok(());
    }

    emit(
        auditor,
        AuditEvent::new(AuditEventKind::FreezeDeny, name_str)
            .with_holder(&existing.lock_id, &existing.owner, &existing.host, existing.pid)
            .with_agent_id(existing.agent_id.as_deref())
            .with_ttl(existing.ttl_sec),
    );
    Err(LockError::Frozen {
        name: name_str.to_string(),
        freeze: Box::new(existing.into()),
    })
}
