use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

/// A logical cache key.
///
/// Keys are used byte-for-byte as file names, so callers must keep them
/// filesystem-safe. A `&str` converts into a *prefixed* key; use
/// [`CacheKey::unprefixed`] to address a file by its bare name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey<'a> {
    name: Cow<'a, str>,
    prefixed: bool,
}

impl<'a> CacheKey<'a> {
    pub fn prefixed(name: impl Into<Cow<'a, str>>) -> Self {
        Self {
            name: name.into(),
            prefixed: true,
        }
    }

    pub fn unprefixed(name: impl Into<Cow<'a, str>>) -> Self {
        Self {
            name: name.into(),
            prefixed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_prefixed(&self) -> bool {
        self.prefixed
    }

    pub fn into_owned(self) -> CacheKey<'static> {
        CacheKey {
            name: Cow::Owned(self.name.into_owned()),
            prefixed: self.prefixed,
        }
    }
}

impl<'a> From<&'a str> for CacheKey<'a> {
    fn from(name: &'a str) -> Self {
        CacheKey::prefixed(name)
    }
}

impl<'a> From<&'a String> for CacheKey<'a> {
    fn from(name: &'a String) -> Self {
        CacheKey::prefixed(name.as_str())
    }
}

impl<'a> From<&'a CacheKey<'_>> for CacheKey<'a> {
    fn from(key: &'a CacheKey<'_>) -> Self {
        Self {
            name: Cow::Borrowed(key.name()),
            prefixed: key.prefixed,
        }
    }
}

impl From<String> for CacheKey<'static> {
    fn from(name: String) -> Self {
        CacheKey::prefixed(name)
    }
}

/// Maps logical keys to files directly under the storage root.
///
/// Resolution is pure string composition; no existence checks and no
/// traversal protection beyond what the filesystem itself provides.
#[derive(Clone, Debug)]
pub struct PathResolver {
    root: PathBuf,
    key_prefix: String,
}

impl PathResolver {
    pub fn new(root: impl AsRef<Path>, key_prefix: impl Into<String>) -> Self {
        Self {
            root: normalize_root(root.as_ref()),
            key_prefix: key_prefix.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Returns the on-disk file name for `key` (prefix applied if requested).
    pub fn file_name(&self, key: &CacheKey<'_>) -> String {
        self.qualify(key.name(), key.is_prefixed())
    }

    pub fn resolve(&self, key: &CacheKey<'_>) -> PathBuf {
        self.root.join(self.file_name(key))
    }

    /// Composes the basename glob used by bulk clears.
    pub fn search_pattern(&self, pattern: &str, prefixed: bool) -> String {
        self.qualify(pattern, prefixed)
    }

    fn qualify(&self, name: &str, prefixed: bool) -> String {
        if prefixed {
            format!("{}{}", self.key_prefix, name)
        } else {
            name.to_string()
        }
    }
}

/// Collapses redundant separators (and any trailing one) so that joining a
/// file name always yields exactly one separator between root and name.
fn normalize_root(root: &Path) -> PathBuf {
    let absolute = if root.is_absolute() {
        root.to_path_buf()
    } else {
        // Relative roots are anchored at the working directory; if that cannot
        // be determined, keep the relative path as-is.
        std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf())
    };

    absolute
        .components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}
