//! End-to-end scenarios against the public API: eviction under each of the
//! three independent limits, two-tier promotion, the inline/out-of-line
//! boundary, and crash recovery via the open-time reconciliation pass.

use std::time::Duration;

use duocache::{Cache, DiskCacheConfig, MemoryCache, MemoryCacheConfig};
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("duocache=debug").try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_count_eviction_drops_the_oldest_key() {
    init_tracing();
    let cache: MemoryCache<i32> = MemoryCache::new(MemoryCacheConfig::default().with_count_limit(3));

    cache.set("a", 1, 1);
    cache.set("b", 2, 1);
    cache.set("c", 3, 1);
    cache.set("d", 4, 1);
    cache.trim_to_count(3);

    assert!(!cache.contains("a"));
    assert!(cache.contains("b"));
    assert!(cache.contains("c"));
    assert!(cache.contains("d"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_cost_eviction_drops_until_within_budget() {
    let cache: MemoryCache<&'static str> = MemoryCache::new(MemoryCacheConfig::default().with_cost_limit(10));

    cache.set("x", "X", 6);
    cache.set("y", "Y", 5);

    assert!(!cache.contains("x"));
    assert!(cache.contains("y"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn memory_age_eviction_drops_stale_entries() {
    let cache: MemoryCache<&'static str> = MemoryCache::new(MemoryCacheConfig::default());

    cache.set("k", "V", 1);
    tokio::time::sleep(Duration::from_secs(2)).await;
    cache.trim_to_age(Duration::from_secs(1));

    assert!(!cache.contains("k"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_tier_promotion_populates_memory_on_disk_hit() {
    let dir = tempdir().unwrap();
    let writer: Cache<String> = Cache::open(
        "promotion",
        dir.path(),
        MemoryCacheConfig::default(),
        DiskCacheConfig::default(),
    )
    .unwrap();
    writer.set("p", "P".to_string(), 1);
    drop(writer);

    let reader: Cache<String> = Cache::open(
        "promotion",
        dir.path(),
        MemoryCacheConfig::default(),
        DiskCacheConfig::default(),
    )
    .unwrap();

    assert_eq!(reader.get("p"), Some("P".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn inline_threshold_boundary_is_exact() {
    let dir = tempdir().unwrap();
    let cache: duocache::DiskCache<Vec<u8>> = duocache::DiskCache::open(
        dir.path(),
        DiskCacheConfig::default().with_inline_threshold(20_480),
    )
    .unwrap();

    let at_threshold = vec![7u8; 20_480];
    let over_threshold = vec![7u8; 20_481];
    cache.set("at", &at_threshold);
    cache.set("over", &over_threshold);

    assert_eq!(cache.get("at"), Some(at_threshold));
    assert_eq!(cache.get("over"), Some(over_threshold));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_recovery_reconciles_on_reopen() {
    let dir = tempdir().unwrap();

    {
        let cache: duocache::DiskCache<i32> = duocache::DiskCache::open(dir.path(), DiskCacheConfig::default()).unwrap();
        for i in 0..100 {
            cache.set(&format!("key-{i}"), &i);
        }
        // no close(): the dirty marker is left behind, simulating a crash
    }

    let reopened: duocache::DiskCache<i32> = duocache::DiskCache::open(dir.path(), DiskCacheConfig::default()).unwrap();
    for i in 0..100 {
        assert_eq!(reopened.get(&format!("key-{i}")), Some(i));
    }

    let data_files = std::fs::read_dir(dir.path().join("data")).unwrap().count();
    assert_eq!(data_files, 0, "every 4-byte i32 value should have been stored inline");
}
