use std::path::Path;
use std::time::{Duration, SystemTime};

/// Returns `true` iff `path` exists and was modified strictly within the last
/// `lifetime`.
///
/// A zero lifetime is never valid. Metadata is re-read on every call.
pub fn is_valid(path: &Path, lifetime: Duration) -> bool {
    if lifetime.is_zero() {
        return false;
    }
    match modified_age(path) {
        Some(age) => age < lifetime,
        None => false,
    }
}

/// Returns `true` if the file at `path` was last modified at least
/// `minimum_age` ago.
///
/// Files whose modification time cannot be read are never old enough.
pub fn is_at_least(path: &Path, minimum_age: Duration) -> bool {
    match modified_age(path) {
        Some(age) => age >= minimum_age,
        None => false,
    }
}

/// Time elapsed since `path` was last modified.
///
/// A modification time in the future (clock skew between writers) counts as
/// age zero.
pub fn modified_age(path: &Path) -> Option<Duration> {
    let modified = modified_time(path)?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) => {
            // Cache misses are expected; only log unexpected filesystem errors.
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "shelf.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to stat cache file"
                );
            }
            return None;
        }
    };
    if !meta.is_file() {
        return None;
    }
    match meta.modified() {
        Ok(time) => Some(time),
        Err(err) => {
            tracing::debug!(
                target = "shelf.cache",
                path = %path.display(),
                error = %err,
                "modification time unavailable for cache file"
            );
            None
        }
    }
}
