//! Tile storage shared by WMS providers.
//!
//! Provides a process-wide, cost-bounded LRU cache of decoded tile images
//! keyed by request URL.

pub mod tile_memory_cache;

pub use tile_memory_cache::{
    image_cost, CacheStatsSnapshot, TileImageCache, TileMemoryCache, TileMemoryCacheStats,
    DEFAULT_CACHE_MB,
};
