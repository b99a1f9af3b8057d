//! Thread-safe, async-capable wrapper around [`crate::kv_storage::KvStorage`]:
//! one mutex per cache, a background trimmer/sweeper pair, and a
//! process-wide weak registry keyed by canonical path so two live instances
//! never point at the same directory.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex as SyncMutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::config::{DiskCacheConfig, StorageMode};
use crate::error::{CacheError, Result};
use crate::kv_storage::KvStorage;
use crate::serializer::{Archiver, DefaultArchiver, DefaultFilenameDeriver, SharedArchiver, SharedFilenameDeriver};

static REGISTRY: Lazy<SyncMutex<HashMap<PathBuf, Weak<DiskCacheCore>>>> = Lazy::new(|| SyncMutex::new(HashMap::new()));

/// The path-addressed, type-erased state: one `KvStorage`, one mutex, one
/// background trimmer, one trash sweeper. Shared by every `DiskCache<V>`
/// wrapper opened against the same canonical path.
struct DiskCacheCore {
    storage: SyncMutex<KvStorage>,
    config: DiskCacheConfig,
    root: PathBuf,
    trimmer: tokio::task::JoinHandle<()>,
    sweeper: tokio::task::JoinHandle<()>,
}

impl Drop for DiskCacheCore {
    fn drop(&mut self) {
        self.trimmer.abort();
        self.sweeper.abort();
    }
}

fn same_shape(a: &DiskCacheConfig, b: &DiskCacheConfig) -> bool {
    a.storage_mode == b.storage_mode
}

impl DiskCacheCore {
    fn open(root: PathBuf, config: DiskCacheConfig, filename_deriver: SharedFilenameDeriver) -> Result<Arc<Self>> {
        let mut registry = REGISTRY.lock();
        if let Some(existing) = registry.get(&root).and_then(Weak::upgrade) {
            if !same_shape(&existing.config, &config) {
                return Err(CacheError::AlreadyOpen);
            }
            warn!(root = %root.display(), "disk cache already open at this path, reusing live instance");
            return Ok(existing);
        }

        let storage = KvStorage::open_with_deriver(&root, config.storage_mode, config.inline_threshold, filename_deriver)?;
        let storage = SyncMutex::new(storage);

        let core = Arc::new_cyclic(|weak: &Weak<DiskCacheCore>| {
            let trimmer = spawn_trimmer(weak.clone(), config.clone());
            let sweeper = spawn_sweeper(weak.clone(), config.auto_trim_interval);
            DiskCacheCore {
                storage,
                config: config.clone(),
                root: root.clone(),
                trimmer,
                sweeper,
            }
        });

        registry.insert(root, Arc::downgrade(&core));
        Ok(core)
    }
}

fn spawn_trimmer(core: Weak<DiskCacheCore>, config: DiskCacheConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.auto_trim_interval);
        loop {
            ticker.tick().await;
            let Some(core) = core.upgrade() else { return };
            if let Err(error) = trim_tick(&core) {
                warn!(%error, "disk trim tick failed, will retry next interval");
            }
        }
    })
}

fn trim_tick(core: &DiskCacheCore) -> Result<()> {
    let mut storage = core.storage.lock();
    if let Some(limit) = core.config.count_limit {
        storage.remove_items_to_fit_count(limit)?;
    }
    if let Some(limit) = core.config.cost_limit {
        storage.remove_items_to_fit_size(limit)?;
    }
    if let Some(age) = core.config.age_limit {
        let cutoff = now_unix() - age.as_secs() as i64;
        storage.remove_all_before_time(cutoff)?;
    }
    if let Some(limit) = core.config.free_disk_space_limit {
        enforce_free_disk_space(&mut storage, &core.root, limit)?;
    }
    Ok(())
}

fn enforce_free_disk_space(storage: &mut KvStorage, root: &Path, limit: u64) -> Result<()> {
    while fs2::available_space(root).map(|free| free < limit).unwrap_or(false) {
        let current = storage.item_size_sum()?;
        if current == 0 {
            break;
        }
        let target = current.saturating_sub(current / 4).min(current.saturating_sub(1));
        let removed = storage.remove_items_to_fit_size(target)?;
        if removed == 0 {
            break;
        }
    }
    Ok(())
}

fn spawn_sweeper(core: Weak<DiskCacheCore>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(core) = core.upgrade() else { return };
            let storage = core.storage.lock();
            match storage.sweep_trash() {
                Ok(count) if count > 0 => tracing::debug!(count, "swept trash entries"),
                Ok(_) => {}
                Err(error) => warn!(%error, "trash sweep failed, will retry next interval"),
            }
        }
    })
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// A typed view over a shared [`DiskCacheCore`]: the archiver is the only
/// thing that differs between wrappers opened against the same path.
pub struct DiskCache<V> {
    core: Arc<DiskCacheCore>,
    archiver: SharedArchiver<V>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for DiskCache<V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            archiver: self.archiver.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V: Serialize + DeserializeOwned + Send + Sync + 'static> DiskCache<V> {
    pub fn open(root: impl AsRef<Path>, config: DiskCacheConfig) -> Result<Self> {
        Self::open_with_archiver(root, config, Arc::new(DefaultArchiver::default()))
    }

    pub fn open_with_archiver(root: impl AsRef<Path>, config: DiskCacheConfig, archiver: SharedArchiver<V>) -> Result<Self> {
        Self::open_with_archiver_and_deriver(root, config, archiver, Arc::new(DefaultFilenameDeriver))
    }

    /// Opens with a custom archiver and/or filename deriver. The deriver
    /// only takes effect the first time a given path is
    /// opened in this process; a later call against an already-live path
    /// reuses the existing core and its original deriver.
    pub fn open_with_archiver_and_deriver(
        root: impl AsRef<Path>,
        config: DiskCacheConfig,
        archiver: SharedArchiver<V>,
        filename_deriver: SharedFilenameDeriver,
    ) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let canonical = root.as_ref().canonicalize()?;
        let core = DiskCacheCore::open(canonical, config, filename_deriver)?;
        Ok(Self {
            core,
            archiver,
            _marker: PhantomData,
        })
    }

    pub fn root(&self) -> &Path {
        &self.core.root
    }

    pub fn mode(&self) -> StorageMode {
        self.core.config.storage_mode
    }

    // -- synchronous API --------------------------------------------------

    pub fn contains(&self, key: &str) -> bool {
        self.core.storage.lock().get(key).ok().flatten().is_some()
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let bytes = self.core.storage.lock().get_value(key).ok().flatten()?;
        self.archiver.unarchive(&bytes).ok()
    }

    pub fn set(&self, key: &str, value: &V) -> bool {
        let Ok(bytes) = self.archiver.archive(value) else {
            return false;
        };
        self.core.storage.lock().save(key, &bytes, None, None).unwrap_or(false)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.core.storage.lock().remove(key).unwrap_or(false)
    }

    pub fn remove_all(&self) -> bool {
        self.core.storage.lock().remove_all(None, None).is_ok()
    }

    pub fn remove_all_with_progress(&self, mut progress: impl FnMut(u64, u64), mut end: impl FnMut(bool)) {
        let mut progress_call = None;
        let mut ended = None;
        {
            let mut storage = self.core.storage.lock();
            let _ = storage.remove_all(
                Some(&mut |removed, total| progress_call = Some((removed, total))),
                Some(&mut |error| ended = Some(error)),
            );
        }
        if let Some((removed, total)) = progress_call {
            progress(removed, total);
        }
        end(ended.unwrap_or(true));
    }

    pub fn item_count(&self) -> u64 {
        self.core.storage.lock().item_count().unwrap_or(0)
    }

    pub fn item_size_sum(&self) -> u64 {
        self.core.storage.lock().item_size_sum().unwrap_or(0)
    }

    // -- async API ----------------------------------------------------------
    // Every mutating/read method enqueues onto the blocking thread pool
    // (the store is a sync, possibly-blocking filesystem + sqlite index) and
    // invokes the callback from that worker, never the caller's thread.

    pub fn contains_async<F>(&self, key: String, callback: F)
    where
        F: FnOnce(String, bool) + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let result = this.contains(&key);
            callback(key, result);
        });
    }

    pub fn get_async<F>(&self, key: String, callback: F)
    where
        F: FnOnce(String, Option<V>) + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let result = this.get(&key);
            callback(key, result);
        });
    }

    pub fn set_async<F>(&self, key: String, value: V, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.set(&key, &value);
            callback();
        });
    }

    pub fn remove_async<F>(&self, key: String, callback: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.remove(&key);
            callback(key);
        });
    }

    pub fn remove_all_async<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            this.remove_all();
            callback();
        });
    }

    pub fn remove_all_async_with_progress<P, E>(&self, mut progress: P, end: E)
    where
        P: FnMut(u64, u64) + Send + 'static,
        E: FnOnce(bool) + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut progress_call = None;
            let mut ended = None;
            {
                let mut storage = this.core.storage.lock();
                let _ = storage.remove_all(
                    Some(&mut |removed, total| progress_call = Some((removed, total))),
                    Some(&mut |error| ended = Some(error)),
                );
            }
            if let Some((removed, total)) = progress_call {
                progress(removed, total);
            }
            end(ended.unwrap_or(true));
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug, Clone)]
    struct Payload(String);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let cache: DiskCache<Payload> = DiskCache::open(dir.path(), DiskCacheConfig::default()).unwrap();

        assert!(cache.set("k", &Payload("v".into())));
        assert_eq!(cache.get("k"), Some(Payload("v".into())));
        assert!(cache.contains("k"));

        assert!(cache.remove("k"));
        assert!(!cache.contains("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_variants_invoke_callback_with_result() {
        let dir = tempdir().unwrap();
        let cache: DiskCache<Payload> = DiskCache::open(dir.path(), DiskCacheConfig::default()).unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        cache.set_async("k".to_string(), Payload("async".into()), move || {
            let _ = tx.send(());
        });
        rx.await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        cache.get_async("k".to_string(), move |key, value| {
            assert_eq!(key, "k");
            let _ = tx.send(value);
        });
        assert_eq!(rx.await.unwrap(), Some(Payload("async".into())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reopening_same_canonical_path_reuses_the_live_core() {
        let dir = tempdir().unwrap();
        let a: DiskCache<Payload> = DiskCache::open(dir.path(), DiskCacheConfig::default()).unwrap();
        let b: DiskCache<Payload> = DiskCache::open(dir.path(), DiskCacheConfig::default()).unwrap();

        a.set("k", &Payload("shared".into()));
        assert_eq!(b.get("k"), Some(Payload("shared".into())));
        assert!(Arc::ptr_eq(&a.core, &b.core));
    }
}
