//! Typed configuration for both tiers. Everything is constructed in-process
//! with fluent builders; there is no external config-file format to parse.

use std::time::Duration;

/// Where an evicted value's destructor actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseThread {
    /// Run on whichever thread happened to trigger the eviction.
    Caller,
    /// Hand off to the host's main-thread executor.
    Main,
}

/// Storage mode for the disk tier, fixed at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Every value is stored out-of-line under `data/`.
    File,
    /// Every value is stored inline in the metadata row.
    Inline,
    /// Values `<= inline_threshold` bytes are stored inline, larger values
    /// out-of-line.
    Mixed,
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::Mixed
    }
}

/// Configuration for the in-process [`crate::memory::MemoryCache`] tier.
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    pub count_limit: Option<u64>,
    pub cost_limit: Option<u64>,
    pub age_limit: Option<Duration>,
    pub auto_trim_interval: Duration,
    pub remove_all_on_memory_warning: bool,
    pub remove_all_on_background: bool,
    pub release_on_main_thread: bool,
    pub release_asynchronously: bool,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            count_limit: None,
            cost_limit: None,
            age_limit: None,
            auto_trim_interval: Duration::from_secs(5),
            remove_all_on_memory_warning: true,
            remove_all_on_background: true,
            release_on_main_thread: false,
            release_asynchronously: true,
        }
    }
}

impl MemoryCacheConfig {
    pub fn with_count_limit(mut self, limit: u64) -> Self {
        self.count_limit = Some(limit);
        self
    }

    pub fn with_cost_limit(mut self, limit: u64) -> Self {
        self.cost_limit = Some(limit);
        self
    }

    pub fn with_age_limit(mut self, limit: Duration) -> Self {
        self.age_limit = Some(limit);
        self
    }

    pub fn with_auto_trim_interval(mut self, interval: Duration) -> Self {
        self.auto_trim_interval = interval;
        self
    }

    pub fn with_release_asynchronously(mut self, value: bool) -> Self {
        self.release_asynchronously = value;
        self
    }
}

/// Default inline/out-of-line boundary, in bytes.
pub const DEFAULT_INLINE_THRESHOLD: u64 = 20_480;

/// Configuration for the [`crate::disk::DiskCache`] tier.
#[derive(Clone)]
pub struct DiskCacheConfig {
    pub count_limit: Option<u64>,
    pub cost_limit: Option<u64>,
    pub age_limit: Option<Duration>,
    pub free_disk_space_limit: Option<u64>,
    pub auto_trim_interval: Duration,
    pub inline_threshold: u64,
    pub storage_mode: StorageMode,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self {
            count_limit: None,
            cost_limit: None,
            age_limit: None,
            free_disk_space_limit: None,
            auto_trim_interval: Duration::from_secs(60),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            storage_mode: StorageMode::default(),
        }
    }
}

impl DiskCacheConfig {
    pub fn with_count_limit(mut self, limit: u64) -> Self {
        self.count_limit = Some(limit);
        self
    }

    pub fn with_cost_limit(mut self, limit: u64) -> Self {
        self.cost_limit = Some(limit);
        self
    }

    pub fn with_age_limit(mut self, limit: Duration) -> Self {
        self.age_limit = Some(limit);
        self
    }

    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn with_inline_threshold(mut self, bytes: u64) -> Self {
        self.inline_threshold = bytes;
        self
    }

    pub fn with_auto_trim_interval(mut self, interval: Duration) -> Self {
        self.auto_trim_interval = interval;
        self
    }

    pub fn with_free_disk_space_limit(mut self, limit: u64) -> Self {
        self.free_disk_space_limit = Some(limit);
        self
    }
}
