use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Hard upper bound for any bincode payload we will attempt to decode.
///
/// A corrupted length prefix must not be able to request an enormous
/// allocation.
pub const BINCODE_PAYLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Serialization strategy used by [`crate::CacheStore::store`] and
/// [`crate::CacheStore::get`].
///
/// The store layer treats encoded bytes as opaque; the codec only needs to
/// round-trip the value types the application caches.
pub trait Codec {
    type Error: std::fmt::Display;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, Self::Error>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error>;
}

/// Compact binary encoding (fixint, little-endian).
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

fn bincode_options() -> impl bincode::Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

impl Codec for BincodeCodec {
    type Error = bincode::Error;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        bincode_options().serialize(value)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error> {
        bincode_options()
            .with_limit(BINCODE_PAYLOAD_LIMIT_BYTES as u64)
            .deserialize(bytes)
    }
}

/// Human-readable JSON encoding, handy when cache files are inspected by hand.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = serde_json::Error;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, Self::Error> {
        serde_json::to_vec(value)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, Self::Error> {
        serde_json::from_slice(bytes)
    }
}
