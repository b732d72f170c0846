//! In-memory LRU cache for decoded tile images.
//!
//! Tiles are keyed by the URL they were requested with and shared by every
//! provider of the process. Entries may disappear at any time, so callers
//! must treat a miss as "fetch again", never as an error.
//!
//! ## Cost-Based Eviction
//!
//! The cache is bounded by the decoded size of its images (4 bytes per
//! pixel) rather than entry count. When an insert would exceed the limit,
//! about 5% of the capacity is evicted in one batch, least recently used
//! first.
//!
//! ## Statistics
//!
//! - `size_bytes`: current cost of all entries
//! - `entry_count`: number of cached tiles
//! - `hits`/`misses`: lookups
//! - `evictions`: total entries evicted
//! - `eviction_runs`: number of batch eviction events
//! - `bytes_evicted_total`: total cost evicted

use async_trait::async_trait;
use image::RgbaImage;
use lru::LruCache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default size of the process-wide cache.
pub const DEFAULT_CACHE_MB: usize = 256;

/// Get/put access to decoded tiles.
///
/// `get` may return `None` for a key that was inserted earlier.
#[async_trait]
pub trait TileImageCache: Send + Sync {
    async fn get(&self, url: &str) -> Option<Arc<RgbaImage>>;

    async fn insert(&self, url: &str, image: Arc<RgbaImage>);
}

/// Cost-bounded LRU cache of decoded tile images.
pub struct TileMemoryCache {
    cache: RwLock<LruCache<String, CachedTile>>,
    max_bytes: u64,
    /// Entries older than this are dropped on read; `None` keeps them until
    /// evicted.
    ttl: Option<Duration>,
    stats: TileMemoryCacheStats,
}

struct CachedTile {
    image: Arc<RgbaImage>,
    cost: u64,
    inserted_at: Instant,
}

/// Counters of one cache, readable without taking the cache lock.
#[derive(Debug, Default)]
pub struct TileMemoryCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub expired: AtomicU64,
    pub size_bytes: AtomicU64,
    pub entry_count: AtomicU64,
    pub eviction_runs: AtomicU64,
    pub bytes_evicted_total: AtomicU64,
}

/// Point in time copy of [`TileMemoryCacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub size_bytes: u64,
    pub entry_count: u64,
    pub eviction_runs: u64,
    pub bytes_evicted_total: u64,
}

impl CacheStatsSnapshot {
    /// Hit rate as a percentage (0-100).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Memory held by a decoded image.
pub fn image_cost(image: &RgbaImage) -> u64 {
    image.width() as u64 * image.height() as u64 * 4
}

impl TileMemoryCache {
    /// Create a cache holding at most `max_size_mb` megabytes of pixels.
    pub fn new(max_size_mb: usize) -> Self {
        Self::with_max_bytes((max_size_mb as u64) * 1024 * 1024)
    }

    pub fn with_max_bytes(max_bytes: u64) -> Self {
        // Eviction is cost based, not by entry count.
        Self {
            cache: RwLock::new(LruCache::unbounded()),
            max_bytes,
            ttl: None,
            stats: TileMemoryCacheStats::default(),
        }
    }

    /// Expire entries `ttl` after insertion.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// The cache shared by all providers of the process.
    pub fn shared() -> Arc<TileMemoryCache> {
        static SHARED: OnceLock<Arc<TileMemoryCache>> = OnceLock::new();
        SHARED
            .get_or_init(|| Arc::new(TileMemoryCache::new(DEFAULT_CACHE_MB)))
            .clone()
    }

    fn is_expired(&self, tile: &CachedTile) -> bool {
        self.ttl
            .map(|ttl| tile.inserted_at.elapsed() > ttl)
            .unwrap_or(false)
    }

    /// Look a tile up, counting hits and misses.
    pub async fn get(&self, url: &str) -> Option<Arc<RgbaImage>> {
        let mut cache = self.cache.write().await;

        let expired = match cache.get(url) {
            Some(tile) if !self.is_expired(tile) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Some(tile.image.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(tile) = cache.pop(url) {
                self.stats.expired.fetch_add(1, Ordering::Relaxed);
                self.stats.size_bytes.fetch_sub(tile.cost, Ordering::Relaxed);
                self.stats.entry_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Whether `url` is cached, without touching LRU order or statistics.
    pub async fn contains(&self, url: &str) -> bool {
        self.cache.read().await.contains(url)
    }

    /// Store a tile, evicting a batch first when it would not fit.
    pub async fn insert(&self, url: &str, image: Arc<RgbaImage>) {
        let cost = image_cost(&image);
        if cost > self.max_bytes {
            debug!(url = %url, cost, "tile larger than cache, not cached");
            return;
        }

        let mut cache = self.cache.write().await;

        if let Some(existing) = cache.pop(url) {
            self.stats
                .size_bytes
                .fetch_sub(existing.cost, Ordering::Relaxed);
            self.stats.entry_count.fetch_sub(1, Ordering::Relaxed);
        }

        while self.stats.size_bytes.load(Ordering::Relaxed) + cost > self.max_bytes {
            if self.evict_batch_locked(&mut cache) == 0 {
                break;
            }
        }

        cache.put(
            url.to_string(),
            CachedTile {
                image,
                cost,
                inserted_at: Instant::now(),
            },
        );
        self.stats.entry_count.fetch_add(1, Ordering::Relaxed);
        self.stats.size_bytes.fetch_add(cost, Ordering::Relaxed);
    }

    /// Evict ~5% of capacity in LRU order. Returns the number of entries
    /// evicted.
    fn evict_batch_locked(&self, cache: &mut LruCache<String, CachedTile>) -> usize {
        let target_free = (self.max_bytes / 20).max(1);
        let mut bytes_freed = 0u64;
        let mut entries_evicted = 0usize;

        while bytes_freed < target_free {
            match cache.pop_lru() {
                Some((_, evicted)) => {
                    bytes_freed += evicted.cost;
                    entries_evicted += 1;
                }
                None => break,
            }
        }

        self.stats
            .size_bytes
            .fetch_sub(bytes_freed, Ordering::Relaxed);
        self.stats
            .entry_count
            .fetch_sub(entries_evicted as u64, Ordering::Relaxed);
        self.stats
            .evictions
            .fetch_add(entries_evicted as u64, Ordering::Relaxed);
        self.stats.eviction_runs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_evicted_total
            .fetch_add(bytes_freed, Ordering::Relaxed);

        info!(
            entries_evicted,
            bytes_freed_mb = format!("{:.2}", bytes_freed as f64 / (1024.0 * 1024.0)),
            max_size_mb = format!("{:.2}", self.max_bytes as f64 / (1024.0 * 1024.0)),
            "tile cache batch eviction completed"
        );

        entries_evicted
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let s = &self.stats;
        CacheStatsSnapshot {
            hits: s.hits.load(Ordering::Relaxed),
            misses: s.misses.load(Ordering::Relaxed),
            evictions: s.evictions.load(Ordering::Relaxed),
            expired: s.expired.load(Ordering::Relaxed),
            size_bytes: s.size_bytes.load(Ordering::Relaxed),
            entry_count: s.entry_count.load(Ordering::Relaxed),
            eviction_runs: s.eviction_runs.load(Ordering::Relaxed),
            bytes_evicted_total: s.bytes_evicted_total.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.stats.entry_count.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Used share of the capacity (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.max_bytes == 0 {
            0.0
        } else {
            self.size_bytes() as f64 / self.max_bytes as f64
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.stats.size_bytes.load(Ordering::Relaxed)
    }

    /// Drop every entry. Hit and miss counters are kept.
    pub async fn clear(&self) {
        let mut cache = self.cache.write().await;
        let entries = cache.len() as u64;
        let bytes = self.stats.size_bytes.swap(0, Ordering::Relaxed);
        cache.clear();
        self.stats.entry_count.store(0, Ordering::Relaxed);
        self.stats.evictions.fetch_add(entries, Ordering::Relaxed);
        self.stats
            .bytes_evicted_total
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Evict a share (0.0 to 1.0) of the entries in LRU order.
    pub async fn evict_percentage(&self, percentage: f64) -> usize {
        let mut cache = self.cache.write().await;
        let to_evict = (cache.len() as f64 * percentage.clamp(0.0, 1.0)) as usize;
        let mut evicted = 0;
        let mut bytes_freed = 0u64;

        for _ in 0..to_evict {
            match cache.pop_lru() {
                Some((_, tile)) => {
                    bytes_freed += tile.cost;
                    evicted += 1;
                }
                None => break,
            }
        }

        self.stats
            .size_bytes
            .fetch_sub(bytes_freed, Ordering::Relaxed);
        self.stats
            .entry_count
            .fetch_sub(evicted as u64, Ordering::Relaxed);
        self.stats
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        self.stats.eviction_runs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_evicted_total
            .fetch_add(bytes_freed, Ordering::Relaxed);

        evicted
    }
}

#[async_trait]
impl TileImageCache for TileMemoryCache {
    async fn get(&self, url: &str) -> Option<Arc<RgbaImage>> {
        TileMemoryCache::get(self, url).await
    }

    async fn insert(&self, url: &str, image: Arc<RgbaImage>) {
        TileMemoryCache::insert(self, url, image).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(size: u32) -> Arc<RgbaImage> {
        Arc::new(RgbaImage::new(size, size))
    }

    #[tokio::test]
    async fn test_cache_basic_operations() {
        let cache = TileMemoryCache::new(100);

        assert!(cache.is_empty());
        assert!(cache.get("http://t/1").await.is_none());

        let image = tile(16);
        cache.insert("http://t/1", image.clone()).await;
        assert_eq!(cache.len(), 1);

        let hit = cache.get("http://t/1").await.unwrap();
        assert!(Arc::ptr_eq(&hit, &image));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.size_bytes, 16 * 16 * 4);
        assert!((stats.hit_rate() - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cache_ttl_expiration() {
        let cache = TileMemoryCache::new(100).with_ttl(Duration::from_millis(50));
        cache.insert("a", tile(4)).await;
        assert!(cache.get("a").await.is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert!(cache.get("a").await.is_none());
        let stats = cache.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.size_bytes, 0);
    }

    #[tokio::test]
    async fn test_cost_based_eviction() {
        // 256x256 RGBA tiles cost 256 KiB, four of them fill 1 MiB.
        let cache = TileMemoryCache::new(1);
        for i in 0..6 {
            cache.insert(&format!("tile{}", i), tile(256)).await;
        }

        let stats = cache.stats();
        assert!(stats.evictions > 0);
        assert!(stats.eviction_runs > 0);
        assert!(stats.size_bytes <= 1024 * 1024);
        // Least recently used go first.
        assert!(!cache.contains("tile0").await);
        assert!(cache.contains("tile5").await);
    }

    #[tokio::test]
    async fn test_replace_keeps_count() {
        let cache = TileMemoryCache::new(100);
        cache.insert("a", tile(2)).await;
        cache.insert("b", tile(2)).await;
        cache.insert("a", tile(4)).await;

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size_bytes(), 4 * 4 * 4 + 2 * 2 * 4);
    }

    #[tokio::test]
    async fn test_oversized_tile_is_not_cached() {
        let cache = TileMemoryCache::with_max_bytes(100);
        cache.insert("big", tile(16)).await;
        assert!(cache.is_empty());
        assert!(cache.get("big").await.is_none());
    }

    #[tokio::test]
    async fn test_clear_and_utilization() {
        let cache = TileMemoryCache::with_max_bytes(1024);
        cache.insert("a", tile(8)).await;
        assert!((cache.utilization() - 0.25).abs() < 1e-9);

        cache.clear().await;
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
        assert!(cache.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_evict_percentage() {
        let cache = TileMemoryCache::new(100);
        for i in 0..10 {
            cache.insert(&format!("tile{}", i), tile(2)).await;
        }

        assert_eq!(cache.evict_percentage(0.5).await, 5);
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.stats().eviction_runs, 1);
    }

    #[tokio::test]
    async fn test_trait_object() {
        let cache: Arc<dyn TileImageCache> = Arc::new(TileMemoryCache::new(1));
        cache.insert("x", tile(1)).await;
        assert!(cache.get("x").await.is_some());
        assert!(Arc::ptr_eq(&TileMemoryCache::shared(), &TileMemoryCache::shared()));
    }
}
