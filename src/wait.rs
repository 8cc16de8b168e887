//! The blocking wait loop (component J): retry `acquire` across a
//! jittered backoff schedule, breaking stale holders as they're found,
//! until success, a non-retryable error, or cancellation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audit::AuditSink;
use crate::backoff::backoff_delay;
use crate::error::LockError;
use crate::identity::IdentityOverrides;
use crate::lockfile::{self, CodecError, ReadOutcome};
use crate::manager::{self, AcquireOptions};
use crate::paths;
use crate::staleness;

/// A cooperative cancellation handle for [`acquire_with_wait`]. Cloning
/// shares the same underlying flag — cancel from any clone, or any
/// thread, to stop every waiter holding one.
#[derive(Clone, Default)]
pub struct WaitContext {
    cancelled: Arc<AtomicBool>,
}

impl WaitContext {
    pub fn new() -> Self {
        WaitContext::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Remove `locks/<name>.json` if the staleness decision (§4.E) deems it
/// stale, or if it's corrupted. A no-op if the lock doesn't exist, is
/// empty (transient), or is live.
pub fn try_break_stale(root: &Path, name: &str) -> std::io::Result<()> {
    let path = paths::lock_path(root, name);
    match lockfile::read(&path) {
        Ok(ReadOutcome::Valid(record)) => {
            if staleness::decide(&record).stale {
                remove_and_fsync(&path)?;
            }
            Ok(())
        }
        Ok(ReadOutcome::Empty) => Ok(()),
        Err(CodecError::Corrupted(_)) => remove_and_fsync(&path),
        Err(CodecError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(CodecError::Io(e)) => Err(e),
        Err(CodecError::UnsupportedVersion(_)) => Ok(()),
    }
}

fn remove_and_fsync(path: &Path) -> std::io::Result<()> {
    std::fs::remove_file(path)?;
    if let Some(dir) = path.parent() {
        lockfile::fsync_dir(dir)?;
    }
    Ok(())
}

/// Options for [`acquire_with_wait`]. `deadline`, when set, bounds total
/// wait time; `None` waits until cancellation or success.
#[derive(Default)]
pub struct WaitOptions<'a> {
    pub ttl: Duration,
    pub identity: IdentityOverrides,
    pub auditor: Option<&'a dyn AuditSink>,
    pub deadline: Option<Instant>,
}

/// Block until `name` is acquired, a non-retryable error surfaces, the
/// deadline passes, or `ctx` is cancelled.
pub fn acquire_with_wait(
    ctx: &WaitContext,
    root: &Path,
    name: &str,
    opts: &WaitOptions,
) -> Result<(), LockError> {
    let acquire_opts = AcquireOptions {
        ttl: opts.ttl,
        identity: opts.identity.clone(),
        auditor: opts.auditor,
    };

    let mut attempt = 0u32;
    loop {
        match manager::acquire(root, name, &acquire_opts) {
            Ok(()) => return Ok(()),
            Err(LockError::Held { .. }) => {}
            Err(other) => return Err(other),
        }

        if ctx.is_cancelled() {
            return Err(LockError::Cancelled {
                name: name.to_string(),
            });
        }
        if let Some(deadline) = opts.deadline {
            if Instant::now() >= deadline {
                return Err(LockError::DeadlineExceeded {
                    name: name.to_string(),
                });
            }
        }

        let delay = backoff_delay(attempt);
        let woke_at = sleep_or_until_cancelled(ctx, delay);
        if woke_at.is_err() {
            return Err(LockError::Cancelled {
                name: name.to_string(),
            });
        }

        let _ = try_break_stale(root, name);
        attempt += 1;
    }
}

/// Sleep for `delay` in short slices so cancellation is observed promptly
/// rather than only between whole-backoff-interval sleeps.
fn sleep_or_until_cancelled(ctx: &WaitContext, delay: Duration) -> Result<(), ()> {
    const SLICE: Duration = Duration::from_millis(20);
    let mut remaining = delay;
    while remaining > Duration::ZERO {
        if ctx.is_cancelled() {
            return Err(());
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
    if ctx.is_cancelled() {
        return Err(());
    }
    Ok(())
}
