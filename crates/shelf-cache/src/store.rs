use crate::codec::{BincodeCodec, Codec};
use crate::error::{CacheError, Result};
use crate::freshness;
use crate::io::{is_in_flight, read_locked, remove_file_best_effort, write_locked};
use crate::lock::LockPolicy;
use crate::path::{CacheKey, PathResolver};
use crate::report::ClearReport;
use globset::{GlobBuilder, GlobMatcher};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Construction-time configuration for a [`CacheStore`].
#[derive(Clone, Debug)]
pub struct CacheStoreConfig {
    /// Directory holding every cache file (flat, non-recursive).
    pub storage_dir: PathBuf,
    /// Prepended to keys addressed in prefixed mode.
    pub key_prefix: String,
    /// Create `storage_dir` (and parents) if it does not exist.
    pub auto_create_dir: bool,
    pub lock: LockPolicy,
}

impl CacheStoreConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            key_prefix: String::new(),
            auto_create_dir: true,
            lock: LockPolicy::default(),
        }
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn auto_create_dir(mut self, auto_create: bool) -> Self {
        self.auto_create_dir = auto_create;
        self
    }

    pub fn lock_policy(mut self, lock: LockPolicy) -> Self {
        self.lock = lock;
        self
    }
}

/// Options for [`CacheStore::clear`].
///
/// The protection and age filters are independent predicates; either can be
/// disabled without affecting the other.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClearOptions {
    /// Basename glob, qualified with the key prefix unless `prefixed` is false.
    pub pattern: String,
    pub prefixed: bool,
    /// Also delete files matching a protected pattern.
    pub include_protected: bool,
    /// Only files at least this old are eligible. Zero disables the filter.
    pub minimum_age: Duration,
}

impl Default for ClearOptions {
    fn default() -> Self {
        Self {
            pattern: "*".to_string(),
            prefixed: true,
            include_protected: false,
            minimum_age: Duration::ZERO,
        }
    }
}

impl ClearOptions {
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn unprefixed(mut self) -> Self {
        self.prefixed = false;
        self
    }

    pub fn include_protected(mut self) -> Self {
        self.include_protected = true;
        self
    }

    pub fn minimum_age(mut self, minimum_age: Duration) -> Self {
        self.minimum_age = minimum_age;
        self
    }
}

#[derive(Clone, Debug)]
struct ProtectedPattern {
    pattern: String,
    matcher: GlobMatcher,
}

/// A filesystem-backed cache rooted at a single flat directory.
///
/// Entries are plain files named `key_prefix + key` (or `key`); freshness is
/// derived from the file's modification time on every read, never cached.
/// Cross-process coordination happens exclusively through file locks, so any
/// number of instances (in any number of processes) may share a directory.
///
/// Misses, disabled state, lock failures and ordinary write failures all
/// degrade to `None`/`false`: callers always keep a "compute it yourself"
/// path. Decode failures are errors.
#[derive(Debug)]
pub struct CacheStore<C = BincodeCodec> {
    resolver: PathResolver,
    lock_policy: LockPolicy,
    codec: C,
    enabled: AtomicBool,
    force_enabled: AtomicBool,
    protected: RwLock<Vec<ProtectedPattern>>,
}

impl CacheStore<BincodeCodec> {
    /// Opens a store with the default [`BincodeCodec`].
    pub fn open(config: CacheStoreConfig) -> Result<Self> {
        Self::with_codec(config, BincodeCodec)
    }
}

impl<C: Codec> CacheStore<C> {
    /// Opens a store using `codec` for [`Self::store`] / [`Self::get`].
    ///
    /// Fails if the storage directory does not exist and cannot (or may not)
    /// be created.
    pub fn with_codec(config: CacheStoreConfig, codec: C) -> Result<Self> {
        let resolver = PathResolver::new(&config.storage_dir, config.key_prefix);
        prepare_storage_dir(resolver.root(), config.auto_create_dir)?;

        Ok(Self {
            resolver,
            lock_policy: config.lock,
            codec,
            enabled: AtomicBool::new(true),
            force_enabled: AtomicBool::new(false),
            protected: RwLock::new(Vec::new()),
        })
    }

    pub fn storage_root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn key_prefix(&self) -> &str {
        self.resolver.key_prefix()
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn lock_policy(&self) -> &LockPolicy {
        &self.lock_policy
    }

    /// Path of the file backing `key`, whether or not it exists.
    pub fn file_path<'k>(&self, key: impl Into<CacheKey<'k>>) -> PathBuf {
        self.resolver.resolve(&key.into())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Keeps the cache working even while [`Self::set_enabled`] is `false`.
    pub fn set_force_enabled(&self, force: bool) {
        self.force_enabled.store(force, Ordering::Relaxed);
    }

    pub fn is_force_enabled(&self) -> bool {
        self.force_enabled.load(Ordering::Relaxed)
    }

    /// Whether reads and writes touch disk at all.
    pub fn is_active(&self) -> bool {
        self.is_enabled() || self.is_force_enabled()
    }

    /// Exempts file names matching `pattern` from [`Self::clear`].
    pub fn add_protected_pattern(&self, pattern: &str) -> Result<()> {
        let matcher = compile_glob(pattern)?.compile_matcher();
        self.protected
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(ProtectedPattern {
                pattern: pattern.to_string(),
                matcher,
            });
        Ok(())
    }

    pub fn protected_patterns(&self) -> Vec<String> {
        self.protected
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|p| p.pattern.clone())
            .collect()
    }

    /// Whether `file_name` (a basename) matches any protected pattern.
    pub fn is_protected(&self, file_name: &str) -> bool {
        self.protected
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|p| p.matcher.is_match(file_name))
    }

    /// Raw contents of `key` if a fresh entry exists.
    pub fn get_raw<'k>(&self, key: impl Into<CacheKey<'k>>, lifetime: Duration) -> Option<Vec<u8>> {
        if !self.is_active() {
            return None;
        }
        let path = self.resolver.resolve(&key.into());
        if !freshness::is_valid(&path, lifetime) {
            return None;
        }
        read_locked(&path, &self.lock_policy)
    }

    /// Decoded value of `key` if a fresh entry exists.
    ///
    /// Undecodable content is a [`CacheError::Decode`], not a miss.
    pub fn get<'k, T: DeserializeOwned>(
        &self,
        key: impl Into<CacheKey<'k>>,
        lifetime: Duration,
    ) -> Result<Option<T>> {
        let key = key.into();
        let Some(bytes) = self.get_raw(&key, lifetime) else {
            return Ok(None);
        };
        match self.codec.decode(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(CacheError::Decode {
                key: self.resolver.file_name(&key),
                message: err.to_string(),
            }),
        }
    }

    pub fn exists<'k>(&self, key: impl Into<CacheKey<'k>>, lifetime: Duration) -> bool {
        if !self.is_active() {
            return false;
        }
        freshness::is_valid(&self.resolver.resolve(&key.into()), lifetime)
    }

    /// Writes `bytes` as the contents of `key`.
    ///
    /// Returns `Ok(false)` when the store is inactive or the write failed;
    /// `Err` only if the storage directory itself has vanished.
    pub fn store_raw<'k>(&self, key: impl Into<CacheKey<'k>>, bytes: &[u8]) -> Result<bool> {
        if !self.is_active() {
            return Ok(false);
        }
        let path = self.resolver.resolve(&key.into());
        write_locked(&path, bytes, &self.lock_policy)
    }

    /// Encodes `value` with the store's codec and writes it under `key`.
    pub fn store<'k, T: Serialize + ?Sized>(
        &self,
        key: impl Into<CacheKey<'k>>,
        value: &T,
    ) -> Result<bool> {
        let key = key.into();
        if !self.is_active() {
            return Ok(false);
        }
        let bytes = self.codec.encode(value).map_err(|err| CacheError::Encode {
            key: self.resolver.file_name(&key),
            message: err.to_string(),
        })?;
        self.store_raw(&key, &bytes)
    }

    /// Returns the cached value of `key`, computing and storing it on a miss.
    ///
    /// A failed cache write does not fail the call; the computed value is
    /// returned either way.
    pub fn get_or_store_with<'k, T, F>(
        &self,
        key: impl Into<CacheKey<'k>>,
        lifetime: Duration,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let key = key.into();
        if let Some(value) = self.get(&key, lifetime)? {
            return Ok(value);
        }
        let value = compute();
        if !self.store(&key, &value)? && self.is_active() {
            tracing::debug!(
                target = "shelf.cache",
                key = %self.resolver.file_name(&key),
                "computed value was not cached"
            );
        }
        Ok(value)
    }

    /// Deletes the entry for `key`. Returns `true` if no file remains.
    pub fn remove<'k>(&self, key: impl Into<CacheKey<'k>>) -> bool {
        if !self.is_active() {
            return false;
        }
        let path = self.resolver.resolve(&key.into());
        remove_file_best_effort(&path, "store.remove")
    }

    /// Bulk-deletes files matching `options.pattern`.
    ///
    /// Files matching a protected pattern are skipped unless
    /// `include_protected`; files younger than `minimum_age` are skipped.
    /// Individual deletion failures are excluded from
    /// [`ClearReport::removed`] without aborting the batch. Runs regardless of
    /// the enabled toggles.
    pub fn clear(&self, options: &ClearOptions) -> Result<ClearReport> {
        let pattern = self
            .resolver
            .search_pattern(&options.pattern, options.prefixed);
        let matcher = compile_glob(&pattern)?.compile_matcher();
        let root = self.resolver.root();

        let mut matched = Vec::new();
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ClearReport::default())
            }
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(
                        target = "shelf.cache",
                        root = %root.display(),
                        error = %err,
                        "failed to read storage directory entry while clearing"
                    );
                    continue;
                }
            };
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => continue,
                Ok(_) => {}
                // Entries can race with concurrent deletion.
                Err(_) => continue,
            }
            let file_name = entry.file_name();
            if !is_in_flight(&file_name) && matcher.is_match(&file_name) {
                matched.push(entry.path());
            }
        }
        // Deterministic ordering.
        matched.sort();

        let considered: Vec<PathBuf> = matched
            .into_iter()
            .filter(|path| options.include_protected || !self.is_protected_path(path))
            .filter(|path| {
                options.minimum_age.is_zero() || freshness::is_at_least(path, options.minimum_age)
            })
            .collect();

        let removed = considered
            .iter()
            .filter(|path| match std::fs::remove_file(path) {
                Ok(()) => true,
                Err(err) => {
                    tracing::debug!(
                        target = "shelf.cache",
                        path = %path.display(),
                        error = %err,
                        "failed to remove cache file while clearing"
                    );
                    false
                }
            })
            .cloned()
            .collect();

        let report = ClearReport {
            considered,
            removed,
        };
        tracing::debug!(
            target = "shelf.cache",
            pattern = %pattern,
            considered = report.considered_count(),
            removed = report.removed_count(),
            "cleared cache files"
        );
        Ok(report)
    }

    fn is_protected_path(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.is_protected(name))
    }
}

fn compile_glob(pattern: &str) -> Result<globset::Glob> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|source| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn prepare_storage_dir(root: &Path, auto_create: bool) -> Result<()> {
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(CacheError::StorageDirNotADirectory {
            path: root.to_path_buf(),
        }),
        Err(_) if !auto_create => Err(CacheError::StorageDirMissing {
            path: root.to_path_buf(),
        }),
        Err(_) => std::fs::create_dir_all(root).map_err(|source| CacheError::StorageDirCreate {
            path: root.to_path_buf(),
            source,
        }),
    }
}
