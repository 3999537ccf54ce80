//! Filesystem-backed cache for serialized values and rendered output fragments.
//!
//! Results of expensive work (queries, templated output) are persisted as
//! plain files so they survive process restarts and can be shared by every
//! process pointed at the same directory.
//!
//! ## On-disk layout
//!
//! A single flat storage directory. Each entry is one file named
//! `key_prefix + key` (prefixed mode, the default) or `key`, byte-for-byte; no
//! escaping is applied, so keys must be filesystem-safe. There are no
//! metadata sidecars:
//! - freshness is the file's modification time compared against a
//!   caller-supplied lifetime, evaluated on every read
//! - contents are opaque bytes: either a [`Codec`]-encoded value
//!   ([`CacheStore::store`]) or a raw fragment ([`CacheStore::store_raw`],
//!   [`CaptureStack`])
//!
//! ## Concurrency
//!
//! Writes stage their bytes in a `.shelf-tmp-*` file beside the entry and
//! rename it into place, so an entry path never names partial contents.
//! Reads hold a shared lock on the entry file, and the rename waits for an
//! exclusive one (see [`LockPolicy`]). Concurrent writers of one key race and
//! the last complete write wins. Nothing stronger than single-file atomicity
//! is provided.

mod capture;
mod codec;
mod error;
mod freshness;
mod io;
mod lock;
mod path;
mod registry;
mod report;
mod store;

pub use capture::{CapturePersistPolicy, CaptureScope, CaptureSession, CaptureStack};
pub use codec::{BincodeCodec, Codec, JsonCodec, BINCODE_PAYLOAD_LIMIT_BYTES};
pub use error::{CacheError, Result};
pub use freshness::{is_at_least, is_valid, modified_age};
pub use lock::LockPolicy;
pub use path::{CacheKey, PathResolver};
pub use registry::{default_store, register_default, replace_default};
pub use report::ClearReport;
pub use store::{CacheStore, CacheStoreConfig, ClearOptions};
