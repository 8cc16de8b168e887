//! Directory layout under a lock manager's root directory.
//!
//! ```text
//! <root>/
//!   locks/<name>.json
//!   freezes/<name>.json
//!   locks/freeze-<name>.json   (legacy freeze path, read-only fallback)
//!   audit.jsonl
//! ```

use std::io;
use std::path::{Path, PathBuf};

pub const LOCKS_DIR: &str = "locks";
pub const FREEZES_DIR: &str = "freezes";
pub const AUDIT_FILE: &str = "audit.jsonl";

pub fn locks_dir(root: &Path) -> PathBuf {
    root.join(LOCKS_DIR)
}

pub fn freezes_dir(root: &Path) -> PathBuf {
    root.join(FREEZES_DIR)
}

pub fn lock_path(root: &Path, name: &str) -> PathBuf {
    locks_dir(root).join(format!("{name}.json"))
}

pub fn freeze_path(root: &Path, name: &str) -> PathBuf {
    freezes_dir(root).join(format!("{name}.json"))
}

/// Pre-1.0 freeze location, still consulted on read so a freeze set by an
/// older build is honored until it expires naturally.
pub fn legacy_freeze_path(root: &Path, name: &str) -> PathBuf {
    locks_dir(root).join(format!("freeze-{name}.json"))
}

pub fn audit_path(root: &Path) -> PathBuf {
    root.join(AUDIT_FILE)
}

/// Create `locks/` and `freezes/` under `root` if they don't already exist,
/// mode 0750.
pub fn ensure_dirs(root: &Path) -> io::Result<()> {
    create_dir_all_0750(&locks_dir(root))?;
    create_dir_all_0750(&freezes_dir(root))?;
    Ok(())
}

#[cfg(unix)]
fn create_dir_all_0750(path: &Path) -> io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;
    DirBuilder::new().recursive(true).mode(0o750).create(path)
}

#[cfg(not(unix))]
fn create_dir_all_0750(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}
