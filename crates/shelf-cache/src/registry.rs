//! Process-wide default [`CacheStore`].
//!
//! Prefer passing stores explicitly. The default slot exists for the
//! application entry point: register once at startup, fetch where threading
//! a handle through is impractical. The slot lives for the whole process.

use crate::store::CacheStore;
use std::sync::{Arc, RwLock};

static DEFAULT_STORE: RwLock<Option<Arc<CacheStore>>> = RwLock::new(None);

/// Registers `store` as the default unless one is already registered.
///
/// Returns the store that is the default after the call: `store` itself on
/// first registration, otherwise the previously registered instance.
pub fn register_default(store: Arc<CacheStore>) -> Arc<CacheStore> {
    let mut slot = DEFAULT_STORE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    match slot.as_ref() {
        Some(existing) => Arc::clone(existing),
        None => {
            *slot = Some(Arc::clone(&store));
            store
        }
    }
}

/// Makes `store` the default unconditionally, returning the one it replaced.
pub fn replace_default(store: Arc<CacheStore>) -> Option<Arc<CacheStore>> {
    let mut slot = DEFAULT_STORE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if slot.is_some() {
        tracing::debug!(target = "shelf.cache", "replacing default cache store");
    }
    slot.replace(store)
}

pub fn default_store() -> Option<Arc<CacheStore>> {
    DEFAULT_STORE
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}
