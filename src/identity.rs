//! Current-process identity: owner, host, pid, and a secondary agent id.
//!
//! Sourced per `spec.md` §4.C: explicit overrides win, then OS-level
//! defaults, then a last-resort constant. Environment-variable sourcing is
//! intentionally limited to `USER`/`USERNAME` for the owner fallback —
//! everything else beyond this struct is out of scope for the core.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use crate::liveness;

/// The identity tuple recorded on every lock this process acquires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub owner: String,
    pub host: String,
    pub pid: u32,
    pub pid_start_ns: Option<i64>,
    pub agent_id: String,
}

/// Explicit overrides for [`Identity::current`]; anything left `None` falls
/// through to the OS-derived default.
#[derive(Debug, Clone, Default)]
pub struct IdentityOverrides {
    pub owner: Option<String>,
    pub agent_id: Option<String>,
}

static MEMOIZED_AGENT_ID: OnceLock<String> = OnceLock::new();

impl Identity {
    /// Resolve the identity of the current process.
    ///
    /// `agent_id`, when auto-generated, is memoized for the life of the
    /// process the first time it is computed — it must stay stable across
    /// repeated calls from the same process regardless of override.
    pub fn current(overrides: &IdentityOverrides) -> Self {
        let pid = std::process::id();
        let pid_start_ns = liveness::process_start(pid);
        let owner = overrides
            .owner
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "unknown".to_string());
        let host = local_host();
        let agent_id = overrides.agent_id.clone().unwrap_or_else(|| {
            MEMOIZED_AGENT_ID
                .get_or_init(|| auto_agent_id(pid, pid_start_ns.unwrap_or(0)))
                .clone()
        });

        Identity {
            owner,
            host,
            pid,
            pid_start_ns,
            agent_id,
        }
    }
}

/// Hostname of the current machine, `"unknown"` if it cannot be determined.
pub fn local_host() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn auto_agent_id(pid: u32, pid_start_ns: i64) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    (pid, pid_start_ns).hash(&mut hasher);
    let truncated = hasher.finish() as u16;
    format!("agent-{truncated:04x}")
}
