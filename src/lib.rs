//! Filesystem-backed advisory lock manager.
//!
//! Mutual exclusion is built on two POSIX primitives only — exclusive
//! file creation (`O_CREAT|O_EXCL`) and atomic `rename` — so it works
//! across unrelated processes on one host, or several hosts sharing a
//! network filesystem that honors those semantics. No `flock`/`fcntl` is
//! used or required.
//!
//! A lock that outlives its holder is recovered three ways: it expires
//! (TTL), its same-host PID is found dead, or its same-host PID has been
//! recycled (start-time mismatch). Cross-host recovery is conservative —
//! only TTL expiry, observed through [`wait::acquire_with_wait`]'s retry
//! loop, can break a lock this process cannot otherwise verify.
//!
//! Every lifecycle event is appended to a tamper-evident JSONL audit
//! trail (`audit.rs`) under a "never fail upward" contract: an audit
//! write failure is logged and swallowed, never surfaced as an error from
//! an acquire/release/renew/freeze call.

pub mod audit;
pub mod backoff;
pub mod error;
pub mod freeze;
pub mod identity;
pub mod liveness;
pub mod lockfile;
pub mod logging;
pub mod manager;
pub mod name;
pub mod paths;
pub mod staleness;
pub mod sweep;
pub mod wait;

pub use audit::{AuditEvent, AuditEventKind, AuditSink, JsonlFileAuditor, NullAuditor};
pub use error::LockError;
pub use freeze::{freeze, unfreeze, check_freeze, FreezeOptions, UnfreezeOptions};
pub use identity::{Identity, IdentityOverrides};
pub use lockfile::LockInfo;
pub use manager::{acquire, release, renew, release_by_owner, AcquireOptions, ReleaseOptions, RenewOptions};
pub use staleness::{decide as decide_staleness, StaleReason, Verdict as StaleVerdict};
pub use sweep::{prune_all_expired, SweepError};
pub use wait::{acquire_with_wait, try_break_stale, WaitContext, WaitOptions};
