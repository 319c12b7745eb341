use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::expiring::{CacheEntry, ExpiringMap, Lookup};
use crate::config::ResultCacheConfig;
use crate::sources::SearchPage;

/// Caché en memoria de URLs de stream resueltas y páginas de búsqueda.
///
/// Ambos mapas expiran por separado. Nada se persiste; tras un reinicio se
/// vuelve a consultar el upstream.
#[derive(Debug)]
pub struct ResultCache {
    streams: ExpiringMap<String, String>,
    searches: ExpiringMap<String, SearchPage>,
    stats: CacheStats,
    sweep_interval: Duration,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
}

/// Contadores instantáneos de un [`ResultCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub stream_entries: usize,
    pub search_entries: usize,
    pub hit_ratio: f64,
}

impl ResultCache {
    pub fn new(config: &ResultCacheConfig) -> Self {
        Self {
            streams: ExpiringMap::new(config.max_entries, config.streaming_url_expiry()),
            searches: ExpiringMap::new(config.max_entries, config.search_result_expiry()),
            stats: CacheStats::default(),
            sweep_interval: config.sweep_interval(),
        }
    }

    pub fn cache_streaming_url(&self, source_key: &str, url: String) {
        let evicted = self.streams.insert(source_key.to_string(), url);
        self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        debug!("💾 Stream URL almacenada en caché: {}", source_key);
    }

    pub fn get_cached_streaming_url(&self, source_key: &str) -> Option<String> {
        let (value, lookup) = self.streams.get(&source_key.to_string());
        self.record(lookup);
        if value.is_some() {
            debug!("✅ Cache hit para stream URL: {}", source_key);
        }
        value
    }

    /// Indica si hay una URL vigente en caché, sin contar un hit.
    pub fn has_streaming_url(&self, source_key: &str) -> bool {
        self.streams.contains_fresh(&source_key.to_string())
    }

    pub fn cache_search_results(&self, query: &str, page: SearchPage) {
        let key = normalize_search_query(query);
        let evicted = self.searches.insert(key, page);
        self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        debug!("💾 Resultados de búsqueda en caché: '{}'", query);
    }

    pub fn get_cached_search_results(&self, query: &str) -> Option<SearchPage> {
        let (value, lookup) = self.searches.get(&normalize_search_query(query));
        self.record(lookup);
        value
    }

    /// Vista de diagnóstico de una entrada de stream.
    pub fn stream_entry(&self, source_key: &str) -> Option<CacheEntry<String>> {
        self.streams.entry(&source_key.to_string())
    }

    /// Elimina las entradas expiradas de ambos mapas.
    pub fn cleanup(&self) -> usize {
        let removed = self.streams.cleanup_expired() + self.searches.cleanup_expired();
        if removed > 0 {
            info!("🧹 Limpieza del caché de resultados: {} entradas expiradas removidas", removed);
        }
        removed
    }

    pub fn clear(&self) {
        self.streams.clear();
        self.searches.clear();
    }

    pub fn get_stats(&self) -> CacheStatistics {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let expired = self.stats.expired.load(Ordering::Relaxed);
        let lookups = hits + misses + expired;

        CacheStatistics {
            hits,
            misses,
            expired,
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            stream_entries: self.streams.len(),
            search_entries: self.searches.len(),
            hit_ratio: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    /// Arranca la limpieza periódica; se detiene al cancelar `shutdown`.
    pub fn start_cleanup_task(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            // El primer tick se completa de inmediato.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.cleanup();
                    }
                }
            }
            debug!("Limpieza del caché de resultados detenida");
        })
    }

    fn record(&self, lookup: Lookup) {
        let counter = match lookup {
            Lookup::Hit => &self.stats.hits,
            Lookup::Miss => &self.stats.misses,
            Lookup::Expired => &self.stats.expired,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Query en minúsculas y con espacios colapsados, usada como clave del caché de
/// búsquedas.
pub fn normalize_search_query(query: &str) -> String {
    query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}
