use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::api_cache::{
    now_millis, scan_entries, CACHE_KEY_PREFIX, META_LAST_CLEANUP_KEY, META_VERSION_KEY,
};
use crate::config::ApiCacheConfig;
use crate::error::CacheError;
use crate::storage::KeyValueStore;

/// Resultado de una pasada de mantenimiento al arrancar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// La versión guardada difería y se borró el caché durable
    pub version_reset: bool,
    pub cleared: usize,
    /// Se ejecutó la limpieza periódica (se omite si la última es reciente)
    pub swept: bool,
    pub expired_removed: usize,
    pub corrupt_removed: usize,
    pub pruned: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl MaintenanceReport {
    pub fn removed(&self) -> usize {
        self.cleared + self.expired_removed + self.corrupt_removed + self.pruned
    }
}

/// Mantenimiento al arrancar del caché durable de API.
pub struct CacheInitializer {
    store: Arc<dyn KeyValueStore>,
    cache_version: String,
    max_cache_size_bytes: u64,
    cleanup_interval: Duration,
    prune_target_ratio: f64,
}

impl CacheInitializer {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        cache_version: impl Into<String>,
        config: &ApiCacheConfig,
    ) -> Self {
        Self {
            store,
            cache_version: cache_version.into(),
            max_cache_size_bytes: config.max_cache_size_bytes(),
            cleanup_interval: config.cleanup_interval(),
            prune_target_ratio: config.prune_target_ratio,
        }
    }

    pub fn with_max_cache_size_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_size_bytes = bytes;
        self
    }

    /// Control de versión y luego la limpieza si la última es más antigua que
    /// el intervalo.
    pub async fn initialize(&self) -> Result<MaintenanceReport, CacheError> {
        let mut report = MaintenanceReport::default();
        self.check_version(&mut report).await?;

        if self.sweep_due().await? {
            self.sweep(&mut report).await?;
        } else {
            debug!("La limpieza del caché corrió hace menos de {:?}, omitiendo", self.cleanup_interval);
        }

        info!(
            "🧰 Mantenimiento del caché completado: {} entradas removidas ({} -> {} bytes)",
            report.removed(),
            report.bytes_before,
            report.bytes_after
        );
        Ok(report)
    }

    /// Ejecuta la limpieza sin importar cuándo fue la última.
    pub async fn run_sweep(&self) -> Result<MaintenanceReport, CacheError> {
        let mut report = MaintenanceReport::default();
        self.sweep(&mut report).await?;
        Ok(report)
    }

    async fn check_version(&self, report: &mut MaintenanceReport) -> Result<(), CacheError> {
        let stored = self
            .store
            .get(META_VERSION_KEY)
            .await?
            .and_then(|raw| serde_json::from_str::<String>(&raw).ok());

        if stored.as_deref() == Some(self.cache_version.as_str()) {
            return Ok(());
        }

        let keys: Vec<String> = self
            .store
            .all_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(CACHE_KEY_PREFIX))
            .collect();
        self.store.multi_remove(&keys).await?;
        self.store
            .set(META_VERSION_KEY, serde_json::to_string(&self.cache_version)?)
            .await?;

        warn!(
            "🔁 Versión del caché cambió ({} -> {}), {} entradas eliminadas",
            stored.as_deref().unwrap_or("ninguna"),
            self.cache_version,
            keys.len()
        );
        report.version_reset = true;
        report.cleared = keys.len();
        Ok(())
    }

    async fn sweep_due(&self) -> Result<bool, CacheError> {
        let last = self
            .store
            .get(META_LAST_CLEANUP_KEY)
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok());

        Ok(match last {
            Some(last) => {
                now_millis().saturating_sub(last) >= self.cleanup_interval.as_millis() as i64
            }
            None => true,
        })
    }

    /// Elimina entradas expiradas y corruptas, y luego las más antiguas
    /// mientras el total supere el techo, parando en cuanto queda bajo el
    /// objetivo.
    async fn sweep(&self, report: &mut MaintenanceReport) -> Result<(), CacheError> {
        let now = now_millis();
        let entries = scan_entries(self.store.as_ref(), CACHE_KEY_PREFIX).await?;
        report.bytes_before = entries.iter().map(|entry| entry.size_bytes).sum();

        let mut doomed = Vec::new();
        let mut survivors = Vec::new();
        for entry in entries {
            match &entry.record {
                None => {
                    report.corrupt_removed += 1;
                    doomed.push(entry.key);
                }
                Some(record) if record.is_expired(now, entry.group) => {
                    report.expired_removed += 1;
                    doomed.push(entry.key);
                }
                Some(record) => survivors.push((record.timestamp, entry.key, entry.size_bytes)),
            }
        }

        let mut total: u64 = survivors.iter().map(|(_, _, size)| size).sum();
        if total > self.max_cache_size_bytes {
            let target = (self.max_cache_size_bytes as f64 * self.prune_target_ratio) as u64;
            survivors.sort_by_key(|(timestamp, _, _)| *timestamp);
            for (_, key, size) in survivors {
                if total <= target {
                    break;
                }
                total -= size;
                report.pruned += 1;
                doomed.push(key);
            }
            info!(
                "✂️ Caché sobre {} bytes, {} entradas antiguas podadas",
                self.max_cache_size_bytes, report.pruned
            );
        }

        self.store.multi_remove(&doomed).await?;
        self.store
            .set(META_LAST_CLEANUP_KEY, now.to_string())
            .await?;

        report.bytes_after = total;
        report.swept = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PersistentCacheRecord;
    use crate::storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn initializer(store: &Arc<MemoryStore>, version: &str) -> CacheInitializer {
        CacheInitializer::new(
            Arc::clone(store) as Arc<dyn KeyValueStore>,
            version,
            &ApiCacheConfig::default(),
        )
    }

    /// Escribe un registro con edad `age_ms` y retorna su tamaño almacenado.
    async fn put(store: &MemoryStore, key: &str, age_ms: i64, payload: &str) -> u64 {
        let record = PersistentCacheRecord {
            data: json!(payload),
            timestamp: now_millis() - age_ms,
            expiration: None,
        };
        let raw = serde_json::to_string(&record).unwrap();
        let size = (key.len() + raw.len()) as u64;
        store.set(key, raw).await.unwrap();
        size
    }

    async fn sorted_keys(store: &MemoryStore) -> Vec<String> {
        let mut keys = store.all_keys().await.unwrap();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_version_mismatch_clears_durable_cache() {
        let store = Arc::new(MemoryStore::new());
        store.set(META_VERSION_KEY, "\"1.0.0\"".into()).await.unwrap();
        store.set("settings:theme", "\"dark\"".into()).await.unwrap();
        put(&store, "api_cache:album:1", 0, "a").await;
        put(&store, "api_cache:artist:2", 0, "b").await;

        let report = initializer(&store, "1.0.1").initialize().await.unwrap();

        assert!(report.version_reset);
        assert_eq!(report.cleared, 2);
        assert_eq!(
            store.get(META_VERSION_KEY).await.unwrap().as_deref(),
            Some("\"1.0.1\"")
        );
        assert!(store.get("settings:theme").await.unwrap().is_some());
        assert!(!sorted_keys(&store)
            .await
            .iter()
            .any(|key| key.starts_with(CACHE_KEY_PREFIX)));
    }

    #[tokio::test]
    async fn test_matching_version_keeps_entries() {
        let store = Arc::new(MemoryStore::new());
        store.set(META_VERSION_KEY, "\"1.0.0\"".into()).await.unwrap();
        put(&store, "api_cache:album:1", 0, "a").await;

        let report = initializer(&store, "1.0.0").initialize().await.unwrap();

        assert!(!report.version_reset);
        assert_eq!(report.removed(), 0);
        assert!(store.get("api_cache:album:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_runs_at_most_once_per_interval() {
        let store = Arc::new(MemoryStore::new());
        store.set(META_VERSION_KEY, "\"1.0.0\"".into()).await.unwrap();
        store
            .set(META_LAST_CLEANUP_KEY, (now_millis() - HOUR_MS).to_string())
            .await
            .unwrap();
        put(&store, "api_cache:home:stale", 2 * HOUR_MS, "old").await;
        store.set("api_cache:track:broken", "{".into()).await.unwrap();

        let skipped = initializer(&store, "1.0.0").initialize().await.unwrap();
        assert!(!skipped.swept);
        assert_eq!(store.len(), 4);

        store
            .set(META_LAST_CLEANUP_KEY, (now_millis() - 25 * HOUR_MS).to_string())
            .await
            .unwrap();
        let swept = initializer(&store, "1.0.0").initialize().await.unwrap();

        assert!(swept.swept);
        assert_eq!(swept.expired_removed, 1);
        assert_eq!(swept.corrupt_removed, 1);
        assert_eq!(
            sorted_keys(&store).await,
            vec![META_LAST_CLEANUP_KEY, META_VERSION_KEY]
        );
        let last: i64 = store
            .get(META_LAST_CLEANUP_KEY)
            .await
            .unwrap()
            .unwrap()
            .parse()
            .unwrap();
        assert!(now_millis() - last < HOUR_MS);
    }

    #[tokio::test]
    async fn test_pruning_stops_at_ninety_percent_of_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let payload = "z".repeat(100);
        let mut sizes = Vec::new();
        // album:0 es la más antigua.
        for i in 0..10i64 {
            let key = format!("api_cache:album:{}", i);
            sizes.push(put(&store, &key, (10 - i) * 60_000, &payload).await);
        }
        let total: u64 = sizes.iter().sum();
        let ceiling = total / 2;
        let target = (ceiling as f64 * 0.9) as u64;

        let report = initializer(&store, "1.0.0")
            .with_max_cache_size_bytes(ceiling)
            .run_sweep()
            .await
            .unwrap();

        assert!(report.pruned > 0);
        assert_eq!(report.bytes_before, total);
        assert!(report.bytes_after <= target);
        // Conservar la entrada podada más reciente habría quedado sobre el
        // objetivo.
        assert!(report.bytes_after + sizes[report.pruned - 1] > target);

        let keys = sorted_keys(&store).await;
        for (i, _) in sizes.iter().enumerate() {
            let key = format!("api_cache:album:{}", i);
            assert_eq!(keys.contains(&key), i >= report.pruned, "{}", key);
        }
    }

    #[tokio::test]
    async fn test_under_ceiling_prunes_nothing() {
        let store = Arc::new(MemoryStore::new());
        put(&store, "api_cache:album:1", 0, "a").await;
        put(&store, "api_cache:album:2", 0, "b").await;

        let report = initializer(&store, "1.0.0").run_sweep().await.unwrap();
        assert_eq!(report.pruned, 0);
        assert_eq!(report.bytes_before, report.bytes_after);
    }
}
