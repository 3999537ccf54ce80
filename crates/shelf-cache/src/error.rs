use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors produced by the cache engine.
///
/// Ordinary cache failures (misses, lock contention, a single failed write or
/// deletion) never surface here; they degrade to `None`/`false`. What remains
/// are configuration problems, programming errors, and codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache storage directory {path} does not exist")]
    StorageDirMissing { path: PathBuf },

    #[error("cache storage path {path} is not a directory")]
    StorageDirNotADirectory { path: PathBuf },

    #[error("failed to create cache storage directory {path}: {source}")]
    StorageDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The storage directory disappeared underneath a live instance.
    #[error("cache storage directory {path} vanished while writing {file}")]
    StorageDirVanished { path: PathBuf, file: PathBuf },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to encode value for cache key {key:?}: {message}")]
    Encode { key: String, message: String },

    #[error("failed to decode cached value for key {key:?}: {message}")]
    Decode { key: String, message: String },

    /// `end` was called on a capture stack with no open session.
    #[error("capture session ended without a matching start")]
    CaptureStackEmpty,

    #[error("captured output for cache key {key:?} could not be persisted")]
    CaptureNotPersisted { key: String },
}

impl CacheError {
    /// Returns `true` for errors that indicate broken caller logic rather than
    /// an environment problem.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, CacheError::CaptureStackEmpty)
    }
}
