//! # Cache Module
//!
//! Caching layers of the resolver pipeline.
//!
//! ## Layers
//!
//! - **[`ResultCache`]**: memory-only cache of resolved stream URLs (20 min)
//!   and search pages (15 min), bounded at 50 entries per map with bulk
//!   eviction of the oldest half. Swept every 5 minutes by a background task.
//! - **[`ApiCacheManager`]**: persistent cache of raw API responses,
//!   partitioned by [`CacheGroup`]. Search responses stay in a two-entry
//!   memory map; everything else goes to the durable
//!   [`KeyValueStore`](crate::storage::KeyValueStore).
//! - **[`CacheInitializer`]**: startup maintenance of the durable cache
//!   (version gate, expiry sweep, size pruning).
//!
//! ## Durable layout
//!
//! ```text
//! api_cache:{group}:{key}   -> {"data": ..., "timestamp": ms, "expiration": ms}
//! cache_meta:version        -> "1.0.0"
//! cache_meta:last_cleanup   -> ms since epoch
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tidal_resolver::cache::{ApiCacheManager, CacheGroup};
//! use tidal_resolver::config::ApiCacheConfig;
//! use tidal_resolver::storage::MemoryStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = ApiCacheManager::new(Arc::new(MemoryStore::new()), &ApiCacheConfig::default());
//!
//! cache
//!     .save_to_cache("album-1", &serde_json::json!({ "title": "Discovery" }), CacheGroup::Album)
//!     .await?;
//!
//! let album: Option<serde_json::Value> = cache.get_from_cache("album-1", CacheGroup::Album).await?;
//! # Ok(())
//! # }
//! ```

pub mod api_cache;
pub mod expiring;
pub mod maintenance;
pub mod result_cache;

pub use api_cache::{ApiCacheManager, ApiCacheStats, CacheGroup, PersistentCacheRecord};
pub use expiring::{CacheEntry, ExpiringMap, Lookup};
pub use maintenance::{CacheInitializer, MaintenanceReport};
pub use result_cache::{normalize_search_query, CacheStatistics, ResultCache};
