#![deny(clippy::all)]

#[cfg(feature = "disk")]
pub mod cache;
pub mod config;
#[cfg(feature = "disk")]
pub mod disk;
pub mod error;
#[cfg(feature = "disk")]
pub mod kv_storage;
pub mod lifecycle;
pub mod lru_index;
pub mod memory;
pub mod serializer;

#[cfg(feature = "disk")]
pub use cache::Cache;
pub use config::{DiskCacheConfig, MemoryCacheConfig, StorageMode};
#[cfg(feature = "disk")]
pub use disk::DiskCache;
pub use error::{CacheError, Result};
pub use lifecycle::LifecycleObserver;
pub use memory::{MemoryCache, ValueReleaser};
pub use serializer::{Archiver, FilenameDeriver};
