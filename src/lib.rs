//! Tidal resolution & caching pipeline.
//!
//! Turns search queries and track references into playable stream URLs
//! through a set of unstable upstream mirrors, with:
//!
//! - an in-memory [`cache::ResultCache`] for stream URLs and search pages
//! - a rate-limited, deduplicated [`preload::PreloadScheduler`]
//! - a failover [`sources::TidalClient`] rotating across mirrors
//! - a persistent, group-partitioned [`cache::ApiCacheManager`] with startup
//!   maintenance ([`cache::CacheInitializer`])
//!
//! [`service::TidalService`] owns and wires all of them.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod preload;
pub mod service;
pub mod sources;
pub mod storage;

pub use config::Config;
pub use error::{CacheError, ResolveError, StoreError};
pub use events::{EventBus, ResolverEvent};
pub use service::TidalService;
