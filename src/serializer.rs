//! Default and pluggable object (de)serialization for the disk tier. The
//! KV storage layer underneath only ever sees bytes; an `Archiver`
//! is what lets [`crate::disk::DiskCache`] and the façade accept arbitrary
//! `Serialize + DeserializeOwned` values.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{CacheError, Result};

/// A pair of user-provided (or default) `serialize`/`deserialize` function
/// objects, falling back to msgpack via `rmp-serde` for common value kinds.
pub trait Archiver<V>: Send + Sync {
    fn archive(&self, value: &V) -> Result<Vec<u8>>;
    fn unarchive(&self, bytes: &[u8]) -> Result<V>;
}

/// The implementation-provided default: messagepack via `rmp-serde`, stable
/// and round-trip-safe for any `Serialize + DeserializeOwned` type.
pub struct DefaultArchiver<V>(PhantomData<fn() -> V>);

impl<V> Default for DefaultArchiver<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<V: Serialize + DeserializeOwned + Send + Sync> Archiver<V> for DefaultArchiver<V> {
    fn archive(&self, value: &V) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value).map_err(|source| CacheError::Serialization { source })
    }

    fn unarchive(&self, bytes: &[u8]) -> Result<V> {
        rmp_serde::from_slice(bytes).map_err(|source| CacheError::Deserialization { source })
    }
}

/// Type-erased handle to whichever archiver a disk cache was configured
/// with, so `DiskCache<V>` doesn't need to be generic over the archiver type.
pub type SharedArchiver<V> = Arc<dyn Archiver<V>>;

/// Derives the out-of-line filename for a key. The default is the hex of a
/// blake3 digest of the key bytes, which is stable per key and collision-
/// resistant enough that two distinct keys never contend for one file.
pub trait FilenameDeriver: Send + Sync {
    fn derive(&self, key: &str) -> String;
}

pub struct DefaultFilenameDeriver;

impl FilenameDeriver for DefaultFilenameDeriver {
    fn derive(&self, key: &str) -> String {
        hex::encode(blake3::hash(key.as_bytes()).as_bytes())
    }
}

pub type SharedFilenameDeriver = Arc<dyn FilenameDeriver>;

#[cfg(test)]
mod test {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn default_archiver_round_trips() {
        let archiver: DefaultArchiver<Point> = DefaultArchiver::default();
        let value = Point { x: 3, y: -7 };
        let bytes = archiver.archive(&value).unwrap();
        assert_eq!(archiver.unarchive(&bytes).unwrap(), value);
    }

    #[test]
    fn filename_deriver_is_stable_per_key() {
        let deriver = DefaultFilenameDeriver;
        assert_eq!(deriver.derive("same-key"), deriver.derive("same-key"));
        assert_ne!(deriver.derive("key-a"), deriver.derive("key-b"));
    }
}
