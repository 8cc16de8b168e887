//! Lock-name validation.
//!
//! Names are restricted to a safe character set so they can be used
//! verbatim as filenames under `locks/` and `freezes/` without any
//! escaping: `^[A-Za-z0-9._-]+$`, non-empty, no leading `/`, no `..`.

use crate::error::LockError;

pub fn validate(name: &str) -> Result<(), LockError> {
    if name.is_empty() {
        return Err(invalid(name));
    }
    if name.starts_with('/') || name.contains("..") {
        return Err(invalid(name));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(invalid(name));
    }
    Ok(())
}

fn invalid(name: &str) -> LockError {
    LockError::InvalidName {
        name: name.to_string(),
    }
}
