//! Thread-safe wrapper around [`crate::lru_index::LruIndex`] enforcing
//! count/cost/age limits and host lifecycle hooks.
//!
//! The index mutex is only ever held across index manipulation; evicted
//! values are handed to a [`ValueReleaser`] after the lock is released, so a
//! value whose `Drop` does expensive or thread-affine work never blocks a
//! concurrent reader.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::MemoryCacheConfig;
use crate::lifecycle::{LifecycleObserver, NullObserver};
use crate::lru_index::{Evicted, LruIndex};

/// Where evicted values actually get dropped. The default just drops them
/// on whichever thread calls it; a host embedding this cache in, say, a
/// windowing toolkit can override `release_on_main` to hop onto its UI
/// thread before dropping values that own UI resources.
pub trait ValueReleaser<V>: Send + Sync {
    fn release(&self, values: Vec<V>) {
        drop(values);
    }

    fn release_on_main(&self, values: Vec<V>) {
        self.release(values);
    }
}

#[derive(Default)]
pub struct DropReleaser;
impl<V> ValueReleaser<V> for DropReleaser {}

pub struct MemoryCache<V> {
    inner: Arc<Mutex<LruIndex<String, V>>>,
    config: MemoryCacheConfig,
    observer: Arc<dyn LifecycleObserver>,
    releaser: Arc<dyn ValueReleaser<V>>,
    release_tx: Option<tokio::sync::mpsc::UnboundedSender<Vec<V>>>,
    trimmer: tokio::task::JoinHandle<()>,
}

impl<V> Drop for MemoryCache<V> {
    fn drop(&mut self) {
        self.trimmer.abort();
    }
}

impl<V: Clone + Send + Sync + 'static> MemoryCache<V> {
    /// Construct a memory cache. Must be called from within a Tokio runtime
    /// context: both the background trimmer and (when configured) the
    /// asynchronous release queue are driven by spawned tasks.
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self::with_observer_and_releaser(config, Arc::new(NullObserver), Arc::new(DropReleaser))
    }

    pub fn with_observer_and_releaser(
        config: MemoryCacheConfig,
        observer: Arc<dyn LifecycleObserver>,
        releaser: Arc<dyn ValueReleaser<V>>,
    ) -> Self {
        let inner: Arc<Mutex<LruIndex<String, V>>> = Arc::new(Mutex::new(LruIndex::new()));

        let release_tx = if config.release_asynchronously {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<V>>();
            let releaser = releaser.clone();
            let on_main = config.release_on_main_thread;
            tokio::spawn(async move {
                while let Some(values) = rx.recv().await {
                    if on_main {
                        releaser.release_on_main(values);
                    } else {
                        releaser.release(values);
                    }
                }
            });
            Some(tx)
        } else {
            None
        };

        let trimmer = {
            let inner = inner.clone();
            let config = config.clone();
            let releaser = releaser.clone();
            let release_tx = release_tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.auto_trim_interval);
                loop {
                    ticker.tick().await;
                    let evicted = {
                        let mut idx = inner.lock();
                        trim_all_locked(&mut idx, &config)
                    };
                    if !evicted.is_empty() {
                        debug!(tier = "memory", evicted = evicted.len(), "auto-trim");
                        dispatch_release(evicted_values(evicted), &config, &releaser, &release_tx);
                    }
                }
            })
        };

        Self {
            inner,
            config,
            observer,
            releaser,
            release_tx,
            trimmer,
        }
    }

    pub fn total_count(&self) -> u64 {
        self.inner.lock().total_count()
    }

    pub fn total_cost(&self) -> u64 {
        self.inner.lock().total_cost()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains(&key.to_string())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lock().lookup(&key.to_string()).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: V, cost: u64) {
        let key = key.into();
        if key.is_empty() {
            return;
        }

        let evicted = {
            let mut idx = self.inner.lock();
            idx.insert_or_update(key, value, cost);
            trim_all_locked(&mut idx, &self.config)
        };
        self.release(evicted);
    }

    /// Remove a key, returning ownership of the value to the caller, who
    /// decides how to dispose of it (the release-policy queue only governs
    /// values evicted *by the cache itself*).
    pub fn remove(&self, key: &str) -> Option<V> {
        if key.is_empty() {
            return None;
        }
        self.inner
            .lock()
            .remove(&key.to_string())
            .map(|evicted| evicted.value)
    }

    pub fn remove_all(&self) {
        let evicted = self.inner.lock().clear();
        self.release(evicted);
    }

    pub fn trim_to_count(&self, limit: u64) {
        let evicted = {
            let mut idx = self.inner.lock();
            trim_count_locked(&mut idx, limit)
        };
        self.release(evicted);
    }

    pub fn trim_to_cost(&self, limit: u64) {
        let evicted = {
            let mut idx = self.inner.lock();
            trim_cost_locked(&mut idx, limit)
        };
        self.release(evicted);
    }

    pub fn trim_to_age(&self, age: Duration) {
        let evicted = {
            let mut idx = self.inner.lock();
            trim_age_locked(&mut idx, age.as_secs_f64())
        };
        self.release(evicted);
    }

    /// Host calls this on a memory-pressure signal; the core never
    /// observes this on its own.
    pub fn on_memory_warning(&self) {
        if self.config.remove_all_on_memory_warning {
            self.remove_all();
        }
        self.observer.on_memory_warning();
    }

    /// Host calls this on a background transition.
    pub fn on_background(&self) {
        if self.config.remove_all_on_background {
            self.remove_all();
        }
        self.observer.on_background();
    }

    fn release(&self, evicted: Vec<Evicted<String, V>>) {
        if evicted.is_empty() {
            return;
        }
        dispatch_release(evicted_values(evicted), &self.config, &self.releaser, &self.release_tx);
    }
}

fn evicted_values<V>(evicted: Vec<Evicted<String, V>>) -> Vec<V> {
    evicted.into_iter().map(|e| e.value).collect()
}

fn dispatch_release<V: Send + 'static>(
    values: Vec<V>,
    config: &MemoryCacheConfig,
    releaser: &Arc<dyn ValueReleaser<V>>,
    release_tx: &Option<tokio::sync::mpsc::UnboundedSender<Vec<V>>>,
) {
    if values.is_empty() {
        return;
    }
    if config.release_asynchronously {
        if let Some(tx) = release_tx {
            let _ = tx.send(values);
            return;
        }
    }
    if config.release_on_main_thread {
        releaser.release_on_main(values);
    } else {
        releaser.release(values);
    }
}

fn trim_count_locked<V>(idx: &mut LruIndex<String, V>, limit: u64) -> Vec<Evicted<String, V>> {
    let mut evicted = Vec::new();
    while idx.total_count() > limit {
        match idx.pop_tail() {
            Some(e) => evicted.push(e),
            None => break,
        }
    }
    evicted
}

fn trim_cost_locked<V>(idx: &mut LruIndex<String, V>, limit: u64) -> Vec<Evicted<String, V>> {
    let mut evicted = Vec::new();
    while idx.total_cost() > limit {
        match idx.pop_tail() {
            Some(e) => evicted.push(e),
            None => break,
        }
    }
    evicted
}

fn trim_age_locked<V>(idx: &mut LruIndex<String, V>, age_limit_secs: f64) -> Vec<Evicted<String, V>> {
    let keys = idx.keys_older_than(age_limit_secs);
    let mut evicted = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(e) = idx.remove(&key) {
            evicted.push(e);
        }
    }
    evicted
}

/// Count first, then cost, then age -- ordering doesn't affect the final
/// state because the three limits are independent.
fn trim_all_locked<V>(idx: &mut LruIndex<String, V>, config: &MemoryCacheConfig) -> Vec<Evicted<String, V>> {
    let mut evicted = Vec::new();
    if let Some(limit) = config.count_limit {
        evicted.extend(trim_count_locked(idx, limit));
    }
    if let Some(limit) = config.cost_limit {
        evicted.extend(trim_cost_locked(idx, limit));
    }
    if let Some(age) = config.age_limit {
        evicted.extend(trim_age_locked(idx, age.as_secs_f64()));
    }
    evicted
}
