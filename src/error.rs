//! The public error type. Every fallible operation in this crate returns
//! `Result<_, LockError>`; I/O and codec failures are wrapped with enough
//! context (name, path) to act on without re-deriving it from `source()`.

use crate::lockfile::LockInfo;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid lock name: {name:?}")]
    InvalidName { name: String },

    #[error("lock {name:?} is already held")]
    Held { name: String, holder: Box<LockInfo> },

    #[error("lock {name:?} is not held")]
    NotFound { name: String },

    #[error("lock {name:?} is held by a different owner")]
    NotOwner {
        name: String,
        existing: Box<LockInfo>,
    },

    #[error("lock {name:?} is not stale: {reason:?}")]
    NotStale {
        name: String,
        existing: Box<LockInfo>,
        reason: crate::staleness::StaleReason,
    },

    #[error("lock {name:?} record at {path:?} is corrupted: {source}")]
    Corrupted {
        name: String,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("lock {name:?} record at {path:?} has unsupported version {version}")]
    UnsupportedVersion {
        name: String,
        path: PathBuf,
        version: u32,
    },

    #[error("renew target {name:?} is no longer owned by the calling process")]
    LockStolen { name: String },

    #[error("lock {name:?} is frozen and cannot be acquired")]
    Frozen { name: String, freeze: Box<LockInfo> },

    #[error("freeze {name:?} requires a positive ttl_sec")]
    FreezeRequiresTtl { name: String },

    #[error("timed out waiting for lock {name:?}")]
    DeadlineExceeded { name: String },

    #[error("wait for lock {name:?} was cancelled")]
    Cancelled { name: String },

    #[error("io error on lock {name:?} at {path:?}: {source}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    pub fn name(&self) -> &str {
        match self {
            LockError::InvalidName { name }
            | LockError::Held { name, .. }
            | LockError::NotFound { name }
            | LockError::NotOwner { name, .. }
            | LockError::NotStale { name, .. }
            | LockError::Corrupted { name, .. }
            | LockError::UnsupportedVersion { name, .. }
            | LockError::LockStolen { name }
            | LockError::Frozen { name, .. }
            | LockError::FreezeRequiresTtl { name }
            | LockError::DeadlineExceeded { name }
            | LockError::Cancelled { name }
            | LockError::Io { name, .. } => name,
        }
    }

    /// Whether retrying the same operation after a short delay is
    /// sensible, as opposed to a permanent misuse error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::Held { .. } | LockError::Frozen { .. } | LockError::Io { .. }
        )
    }

    pub(crate) fn io(name: &str, path: &std::path::Path, source: std::io::Error) -> Self {
        LockError::Io {
            name: name.to_string(),
            path: path.to_path_buf(),
            source,
        }
    }
}
