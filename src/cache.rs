//! Unified two-tier façade: a [`crate::memory::MemoryCache`] sitting
//! in front of a [`crate::disk::DiskCache`], sharing one name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{DiskCacheConfig, MemoryCacheConfig};
use crate::disk::DiskCache;
use crate::error::Result;
use crate::lifecycle::{LifecycleObserver, NullObserver};
use crate::memory::{DropReleaser, MemoryCache, ValueReleaser};
use crate::serializer::SharedArchiver;

/// A named two-tier cache: reads check memory first and promote disk hits
/// back into memory; writes land in both tiers.
pub struct Cache<V> {
    name: String,
    memory: MemoryCache<V>,
    disk: DiskCache<V>,
}

impl<V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static> Cache<V> {
    pub fn open(
        name: impl Into<String>,
        root: impl AsRef<Path>,
        memory_config: MemoryCacheConfig,
        disk_config: DiskCacheConfig,
    ) -> Result<Self> {
        Self::open_with(
            name,
            root,
            memory_config,
            disk_config,
            Arc::new(NullObserver),
            Arc::new(DropReleaser),
            Arc::new(crate::serializer::DefaultArchiver::default()),
        )
    }

    pub fn open_with(
        name: impl Into<String>,
        root: impl AsRef<Path>,
        memory_config: MemoryCacheConfig,
        disk_config: DiskCacheConfig,
        observer: Arc<dyn LifecycleObserver>,
        releaser: Arc<dyn ValueReleaser<V>>,
        archiver: SharedArchiver<V>,
    ) -> Result<Self> {
        let memory = MemoryCache::with_observer_and_releaser(memory_config, observer, releaser);
        let disk = DiskCache::open_with_archiver(root, disk_config, archiver)?;
        Ok(Self {
            name: name.into(),
            memory,
            disk,
        })
    }

    /// Opens (or reuses) a disk-backed cache named `name` under the host's
    /// standard per-application cache directory, falling back to
    /// `./cache/<name>` when no such directory can be resolved for this
    /// platform.
    #[cfg(feature = "dirs")]
    pub fn with_name(name: impl Into<String>, memory_config: MemoryCacheConfig, disk_config: DiskCacheConfig) -> Result<Self> {
        let name = name.into();
        let root = cache_root_for(&name);
        Self::open(name, root, memory_config, disk_config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks only whether the key is present; a disk hit does not promote
    /// into memory (unlike [`Self::get`]), since containment checks are not
    /// meant to carry the cost of a full read.
    pub fn contains(&self, key: &str) -> bool {
        self.memory.contains(key) || self.disk.contains(key)
    }

    /// Memory-tier hit returns immediately. A disk-tier hit is promoted into
    /// memory with cost `0`, leaving cost accounting to the caller if the
    /// memory tier enforces a cost limit for this cache.
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(value) = self.memory.get(key) {
            return Some(value);
        }
        let value = self.disk.get(key)?;
        self.memory.set(key.to_string(), value.clone(), 0);
        Some(value)
    }

    pub fn set(&self, key: impl Into<String>, value: V, cost: u64) {
        let key = key.into();
        self.memory.set(key.clone(), value.clone(), cost);
        self.disk.set(&key, &value);
    }

    pub fn set_async<F>(&self, key: impl Into<String>, value: V, cost: u64, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let key = key.into();
        self.memory.set(key.clone(), value.clone(), cost);
        self.disk.set_async(key, value, callback);
    }

    pub fn remove(&self, key: &str) {
        self.memory.remove(key);
        self.disk.remove(key);
    }

    pub fn remove_async<F>(&self, key: impl Into<String>, callback: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        let key = key.into();
        self.memory.remove(&key);
        self.disk.remove_async(key, callback);
    }

    pub fn remove_all(&self) {
        self.memory.remove_all();
        self.disk.remove_all();
    }

    pub fn on_memory_warning(&self) {
        self.memory.on_memory_warning();
    }

    pub fn on_background(&self) {
        self.memory.on_background();
    }

    pub fn disk_root(&self) -> &Path {
        self.disk.root()
    }
}

#[cfg(feature = "dirs")]
fn cache_root_for(name: &str) -> PathBuf {
    directories::ProjectDirs::from("", "", name)
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("cache").join(name))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{DiskCacheConfig, MemoryCacheConfig};
    use tempfile::tempdir;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug, Clone)]
    struct Payload(String);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disk_hit_promotes_into_memory() {
        let dir = tempdir().unwrap();
        let cache: Cache<Payload> = Cache::open(
            "promotion",
            dir.path(),
            MemoryCacheConfig::default(),
            DiskCacheConfig::default(),
        )
        .unwrap();

        cache.set("k", Payload("v".into()), 1);
        // simulate a fresh process: drop the in-memory tier's knowledge by
        // constructing a brand-new façade sharing the same disk root.
        let reopened: Cache<Payload> = Cache::open(
            "promotion",
            dir.path(),
            MemoryCacheConfig::default(),
            DiskCacheConfig::default(),
        )
        .unwrap();

        assert!(!reopened.memory.contains("k"));
        assert_eq!(reopened.get("k"), Some(Payload("v".into())));
        assert!(reopened.memory.contains("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_all_clears_both_tiers() {
        let dir = tempdir().unwrap();
        let cache: Cache<Payload> = Cache::open(
            "clear",
            dir.path(),
            MemoryCacheConfig::default(),
            DiskCacheConfig::default(),
        )
        .unwrap();

        cache.set("a", Payload("1".into()), 1);
        cache.set("b", Payload("2".into()), 1);
        cache.remove_all();

        assert!(!cache.contains("a"));
        assert!(!cache.contains("b"));
    }
}
