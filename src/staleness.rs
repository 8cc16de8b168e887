//! The staleness decision procedure (component E): given a parsed lock
//! record, decide whether its holder is provably gone.
//!
//! This is the one piece of logic every other component consults before
//! touching someone else's lock — acquire's auto-prune step, release's
//! break-stale mode, the sweep, and the wait loop's retry path all defer
//! to [`decide`].

use crate::identity::local_host;
use crate::liveness;
use crate::lockfile::LockRecord;
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    Expired,
    DeadPid,
    NotStale,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub stale: bool,
    pub reason: StaleReason,
}

impl Verdict {
    fn stale(reason: StaleReason) -> Self {
        Verdict { stale: true, reason }
    }

    fn live(reason: StaleReason) -> Self {
        Verdict { stale: false, reason }
    }
}

/// Decide whether `record`'s holder is provably gone. Ordered rules, first
/// applicable wins: TTL expiry beats everything (even a live same-host
/// PID), then same-host liveness/recycling, then — cross-host, no TTL
/// expiry — an honest `Unknown`, since remote PIDs cannot be verified.
pub fn decide(record: &LockRecord) -> Verdict {
    if record.ttl_sec > 0 {
        let age = Utc::now().signed_duration_since(record.acquired_ts);
        if age.num_seconds() > record.ttl_sec as i64 {
            return Verdict::stale(StaleReason::Expired);
        }
    }

    if record.host == local_host() {
        if !liveness::is_alive(record.pid) {
            return Verdict::stale(StaleReason::DeadPid);
        }
        if let Some(recorded_start) = record.pid_start_ns.filter(|ns| *ns != 0) {
            return match liveness::process_start(record.pid) {
                Some(current_start) if current_start != recorded_start => {
                    Verdict::stale(StaleReason::DeadPid)
                }
                Some(_) => Verdict::live(StaleReason::NotStale),
                None => Verdict::live(StaleReason::NotStale),
            };
        }
        return Verdict::live(StaleReason::NotStale);
    }

    Verdict::live(StaleReason::Unknown)
}
