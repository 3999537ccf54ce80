use crate::error::CacheError;
use crate::lock::{self, LockMode, LockPolicy};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Reads the full contents of `path` under a shared lock.
///
/// Returns `None` when the file does not exist, cannot be read, or (with
/// [`LockPolicy::require_lock`]) cannot be locked.
pub(crate) fn read_locked(path: &Path, policy: &LockPolicy) -> Option<Vec<u8>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "shelf.cache",
                    path = %path.display(),
                    error = %err,
                    "failed to open cache file"
                );
            }
            return None;
        }
    };

    let _lock = lock::acquire(&file, path, LockMode::Shared, policy).ok()?;

    let mut bytes = Vec::new();
    match (&file).read_to_end(&mut bytes) {
        Ok(_) => Some(bytes),
        Err(err) => {
            tracing::debug!(
                target = "shelf.cache",
                path = %path.display(),
                error = %err,
                "failed to read cache file"
            );
            None
        }
    }
}

/// File-name prefix of entries still being written.
pub(crate) const IN_FLIGHT_PREFIX: &str = ".shelf-tmp-";

/// Whether `file_name` belongs to a write that has not been published yet.
pub(crate) fn is_in_flight(file_name: &OsStr) -> bool {
    file_name
        .to_str()
        .is_some_and(|name| name.starts_with(IN_FLIGHT_PREFIX))
}

/// Replaces the contents of `path` with `bytes`.
///
/// The bytes go to a temporary file next to `path` that is renamed over the
/// entry once synced, so the entry path only ever names complete contents.
/// The rename happens under an exclusive lock on the current entry (if any)
/// so in-flight locked readers finish first. Ordinary I/O failures return
/// `Ok(false)`; a storage directory that has disappeared is reported as
/// [`CacheError::StorageDirVanished`].
pub(crate) fn write_locked(
    path: &Path,
    bytes: &[u8],
    policy: &LockPolicy,
) -> Result<bool, CacheError> {
    let Some(dir) = path.parent() else {
        return Ok(false);
    };

    let mut builder = tempfile::Builder::new();
    builder.prefix(IN_FLIGHT_PREFIX);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        // Entries are shared between processes; don't keep tempfile's 0600.
        builder.permissions(std::fs::Permissions::from_mode(0o644));
    }
    let mut staged = match builder.tempfile_in(dir) {
        Ok(staged) => staged,
        Err(err) => return write_failed(path, dir, &err, "failed to stage cache file"),
    };

    let staged_result = staged
        .write_all(bytes)
        .and_then(|()| staged.as_file().sync_data());
    if let Err(err) = staged_result {
        return write_failed(path, dir, &err, "failed to write cache file");
    }

    let current = match File::open(path) {
        Ok(file) => Some(file),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => return write_failed(path, dir, &err, "failed to open cache file"),
    };
    let _lock = match &current {
        Some(file) => match lock::acquire(file, path, LockMode::Exclusive, policy) {
            Ok(lock) => Some(lock),
            Err(_) => return Ok(false),
        },
        None => None,
    };

    match staged.persist(path) {
        Ok(_) => Ok(true),
        // Dropping the returned temp file removes it.
        Err(err) => write_failed(path, dir, &err.error, "failed to publish cache file"),
    }
}

fn write_failed(
    path: &Path,
    dir: &Path,
    err: &io::Error,
    message: &'static str,
) -> Result<bool, CacheError> {
    if err.kind() == io::ErrorKind::NotFound && !dir.is_dir() {
        return Err(CacheError::StorageDirVanished {
            path: dir.to_path_buf(),
            file: path.to_path_buf(),
        });
    }
    tracing::debug!(
        target = "shelf.cache",
        path = %path.display(),
        error = %err,
        "{message}"
    );
    Ok(false)
}

/// Removes `path`, reporting whether the file is gone afterwards.
pub(crate) fn remove_file_best_effort(path: &Path, reason: &'static str) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => true,
        Err(err) => {
            tracing::debug!(
                target = "shelf.cache",
                path = %path.display(),
                reason,
                error = %err,
                "failed to remove cache file"
            );
            false
        }
    }
}
