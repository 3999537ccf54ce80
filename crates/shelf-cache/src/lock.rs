use fs2::FileExt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Reader lock; any number of holders.
    Shared,
    /// Writer lock; excludes readers and other writers.
    Exclusive,
}

/// How hard to try for a cache file lock.
///
/// Lock acquisition never blocks indefinitely: it polls every
/// `retry_interval` until `timeout` elapses. On failure the operation either
/// proceeds without the lock (emitting a `warn` event) or, when
/// `require_lock` is set, degrades to a miss / failed write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockPolicy {
    pub timeout: Duration,
    pub retry_interval: Duration,
    pub require_lock: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            retry_interval: Duration::from_millis(5),
            require_lock: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum LockFailure {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("locking unsupported: {0}")]
    Unsupported(io::Error),
}

/// A held (or deliberately bypassed) lock on an open cache file.
///
/// Locks belong to the open file handle, so two handles on one path conflict
/// even inside a single process. Released on drop.
#[derive(Debug)]
pub(crate) struct FileLock<'f> {
    file: Option<&'f File>,
}

impl FileLock<'_> {
    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        self.file.is_some()
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file {
            // Explicit trait calls: std's inherent `File` lock methods shadow fs2's.
            let _ = FileExt::unlock(file);
        }
    }
}

/// Locks `file` (opened from `path`) according to `policy`.
///
/// Returns `Err` only when the lock could not be taken and the policy
/// requires it; otherwise a failed acquisition yields an unheld [`FileLock`]
/// after logging a warning.
pub(crate) fn acquire<'f>(
    file: &'f File,
    path: &Path,
    mode: LockMode,
    policy: &LockPolicy,
) -> Result<FileLock<'f>, LockFailure> {
    let deadline = Instant::now() + policy.timeout;
    let outcome = retry_until(deadline, policy.retry_interval, || {
        let result = match mode {
            LockMode::Shared => FileExt::try_lock_shared(file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        };
        match result {
            Ok(()) => Attempt::Acquired(()),
            Err(err) if is_contended(&err) => Attempt::Contended,
            Err(err) => Attempt::Failed(err),
        }
    });

    match outcome {
        Ok(()) => Ok(FileLock { file: Some(file) }),
        Err(failure) if policy.require_lock => {
            tracing::warn!(
                target = "shelf.cache",
                path = %path.display(),
                ?mode,
                error = %failure,
                "failed to lock cache file; skipping operation"
            );
            Err(failure)
        }
        Err(failure) => {
            tracing::warn!(
                target = "shelf.cache",
                path = %path.display(),
                ?mode,
                error = %failure,
                "failed to lock cache file; proceeding without lock"
            );
            Ok(FileLock { file: None })
        }
    }
}

enum Attempt<T> {
    Acquired(T),
    Contended,
    Failed(io::Error),
}

fn retry_until<T>(
    deadline: Instant,
    retry_interval: Duration,
    mut attempt: impl FnMut() -> Attempt<T>,
) -> Result<T, LockFailure> {
    let started = Instant::now();
    loop {
        match attempt() {
            Attempt::Acquired(value) => return Ok(value),
            Attempt::Failed(err) => return Err(LockFailure::Unsupported(err)),
            Attempt::Contended => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(LockFailure::TimedOut(now.duration_since(started)));
        }
        thread::sleep(retry_interval.min(deadline - now));
    }
}

fn is_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    let contended = fs2::lock_contended_error();
    err.raw_os_error().is_some() && err.raw_os_error() == contended.raw_os_error()
}
