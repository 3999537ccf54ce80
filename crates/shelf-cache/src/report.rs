use serde::Serialize;
use std::path::PathBuf;

/// Result summary from [`crate::CacheStore::clear`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    /// Every path that survived the protection and age filters, i.e. the set
    /// deletion was attempted on.
    pub considered: Vec<PathBuf>,
    /// Subset of `considered` that was actually removed.
    pub removed: Vec<PathBuf>,
}

impl ClearReport {
    pub fn considered_count(&self) -> usize {
        self.considered.len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    /// Paths that were eligible but could not be deleted.
    pub fn failed(&self) -> impl Iterator<Item = &PathBuf> + '_ {
        self.considered
            .iter()
            .filter(move |path| !self.removed.contains(path))
    }

    pub fn is_complete(&self) -> bool {
        self.considered.len() == self.removed.len()
    }
}
