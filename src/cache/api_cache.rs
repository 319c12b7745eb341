use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::expiring::ExpiringMap;
use crate::config::ApiCacheConfig;
use crate::error::{CacheError, StoreError};
use crate::storage::KeyValueStore;

/// Prefijo de toda entrada durable escrita por [`ApiCacheManager`].
pub const CACHE_KEY_PREFIX: &str = "api_cache:";
pub const META_LAST_CLEANUP_KEY: &str = "cache_meta:last_cleanup";
pub const META_VERSION_KEY: &str = "cache_meta:version";

/// Partición lógica del caché de API, cada una con su propia retención.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheGroup {
    Search,
    Playlist,
    Album,
    Artist,
    Track,
    Home,
}

impl CacheGroup {
    pub const ALL: [CacheGroup; 6] = [
        CacheGroup::Search,
        CacheGroup::Playlist,
        CacheGroup::Album,
        CacheGroup::Artist,
        CacheGroup::Track,
        CacheGroup::Home,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheGroup::Search => "search",
            CacheGroup::Playlist => "playlist",
            CacheGroup::Album => "album",
            CacheGroup::Artist => "artist",
            CacheGroup::Track => "track",
            CacheGroup::Home => "home",
        }
    }

    /// Edad máxima de un registro durable de este grupo.
    pub fn max_age(&self) -> Duration {
        const MINUTE: u64 = 60;
        const HOUR: u64 = 60 * MINUTE;
        Duration::from_secs(match self {
            CacheGroup::Search => 2 * MINUTE,
            CacheGroup::Playlist => 30 * MINUTE,
            CacheGroup::Album | CacheGroup::Artist => 24 * HOUR,
            CacheGroup::Track => 6 * HOUR,
            CacheGroup::Home => HOUR,
        })
    }

    /// Las búsquedas cambian demasiado rápido para valer la pena persistirlas.
    pub fn is_memory_only(&self) -> bool {
        matches!(self, CacheGroup::Search)
    }

    /// Prefijo de clave durable del grupo, `api_cache:{group}:`.
    pub fn key_prefix(&self) -> String {
        format!("{}{}:", CACHE_KEY_PREFIX, self.as_str())
    }

    pub fn durable_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix(), key)
    }

    /// Grupo codificado en una clave durable, si la clave es nuestra.
    pub fn from_durable_key(full_key: &str) -> Option<Self> {
        let rest = full_key.strip_prefix(CACHE_KEY_PREFIX)?;
        let (group, _) = rest.split_once(':')?;
        group.parse().ok()
    }
}

impl fmt::Display for CacheGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheGroup::ALL
            .into_iter()
            .find(|group| group.as_str() == s)
            .ok_or_else(|| format!("unknown cache group '{}'", s))
    }
}

/// Lo que se guarda bajo una clave durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentCacheRecord {
    pub data: Value,
    /// Milisegundos desde el epoch Unix
    pub timestamp: i64,
    /// Tiempo de vida en milisegundos
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
}

impl PersistentCacheRecord {
    pub fn new(data: Value, ttl: Option<Duration>) -> Self {
        Self {
            data,
            timestamp: now_millis(),
            expiration: ttl.map(|ttl| ttl.as_millis() as i64),
        }
    }

    pub fn age_millis(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }

    /// Expirado por su propio TTL o por la edad máxima del grupo.
    pub fn is_expired(&self, now: i64, group: Option<CacheGroup>) -> bool {
        let age = self.age_millis(now);
        let own = self.expiration.is_some_and(|ttl| age > ttl);
        let by_group = group.is_some_and(|group| age > group.max_age().as_millis() as i64);
        own || by_group
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Una entrada durable tal como se encontró en un escaneo.
#[derive(Debug)]
pub(crate) struct ScannedEntry {
    pub key: String,
    pub group: Option<CacheGroup>,
    /// `None` si el valor guardado no se puede parsear
    pub record: Option<PersistentCacheRecord>,
    pub size_bytes: u64,
}

/// Lee todas las entradas durables con `prefix`.
pub(crate) async fn scan_entries(
    store: &dyn KeyValueStore,
    prefix: &str,
) -> Result<Vec<ScannedEntry>, StoreError> {
    let keys: Vec<String> = store
        .all_keys()
        .await?
        .into_iter()
        .filter(|key| key.starts_with(prefix))
        .collect();

    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        let Some(raw) = store.get(&key).await? else {
            continue;
        };
        let record = serde_json::from_str::<PersistentCacheRecord>(&raw).ok();
        entries.push(ScannedEntry {
            group: CacheGroup::from_durable_key(&key),
            size_bytes: (key.len() + raw.len()) as u64,
            key,
            record,
        });
    }
    Ok(entries)
}

/// Estimación continua del tamaño del caché durable.
///
/// `last_cleanup` es `None` cuando la última limpieza es demasiado antigua para
/// representarla, lo que fuerza una limpieza en la siguiente escritura.
#[derive(Debug)]
struct AggregateTracker {
    bytes: u64,
    last_cleanup: Option<Instant>,
}

impl AggregateTracker {
    fn reset(&mut self, bytes: u64) {
        self.bytes = bytes;
        self.last_cleanup = Some(Instant::now());
    }
}

/// Contadores devueltos por [`ApiCacheManager::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiCacheStats {
    pub memory_entries: usize,
    pub durable_entries: usize,
    pub durable_bytes: u64,
    pub corrupt_entries: usize,
    pub entries_by_group: BTreeMap<CacheGroup, usize>,
}

/// Caché persistente de respuestas crudas de la API, particionado por grupo.
///
/// Las búsquedas quedan en un mapa pequeño en memoria; el resto de grupos se
/// escribe en el almacén durable como [`PersistentCacheRecord`].
pub struct ApiCacheManager {
    store: Arc<dyn KeyValueStore>,
    search_memory: ExpiringMap<String, Value>,
    aggregate: Mutex<AggregateTracker>,
    max_aggregate_bytes: u64,
    aggregate_cleanup_interval: Duration,
    max_durable_entries: usize,
    retained_durable_entries: usize,
    prune_target_ratio: f64,
}

impl ApiCacheManager {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &ApiCacheConfig) -> Self {
        Self {
            store,
            search_memory: ExpiringMap::new(
                config.search_memory_entries,
                config.search_memory_expiry(),
            ),
            aggregate: Mutex::new(AggregateTracker {
                bytes: 0,
                last_cleanup: Some(Instant::now()),
            }),
            max_aggregate_bytes: config.max_aggregate_bytes as u64,
            aggregate_cleanup_interval: config.aggregate_cleanup_interval(),
            max_durable_entries: config.max_durable_entries,
            retained_durable_entries: config.retained_durable_entries,
            prune_target_ratio: config.prune_target_ratio,
        }
    }

    /// Guarda `data` bajo `key` en `group`.
    ///
    /// Retorna `false` si la escritura se abandonó porque el almacén siguió
    /// lleno tras una limpieza forzada.
    pub async fn save_to_cache<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        data: &T,
        group: CacheGroup,
    ) -> Result<bool, CacheError> {
        let value = serde_json::to_value(data)?;

        if group.is_memory_only() {
            self.search_memory.insert(key.to_string(), value);
            debug!("💾 {} en caché de memoria: {}", group, key);
            return Ok(true);
        }

        let full_key = group.durable_key(key);
        let serialized = serde_json::to_string(&PersistentCacheRecord::new(
            value,
            Some(group.max_age()),
        ))?;
        let size = (full_key.len() + serialized.len()) as u64;
        let previous = self
            .store
            .get(&full_key)
            .await?
            .map_or(0, |raw| (full_key.len() + raw.len()) as u64);

        if self.needs_group_cleanup(size.saturating_sub(previous)) {
            self.cleanup_group(group).await?;
        }

        match self.store.set(&full_key, serialized.clone()).await {
            Ok(()) => {}
            Err(e) if e.is_full() => {
                warn!("💽 Almacén lleno al escribir {}, forzando limpieza", full_key);
                self.force_full_cleanup().await?;
                if let Err(e) = self.store.set(&full_key, serialized).await {
                    warn!("❌ Abandonando escritura de {} tras la limpieza: {}", full_key, e);
                    return Ok(false);
                }
            }
            Err(e) => return Err(e.into()),
        }

        {
            let mut aggregate = self.aggregate.lock();
            // Sobrescribir reemplaza el registro anterior; una limpieza puede
            // haberlo quitado ya del total.
            aggregate.bytes = aggregate.bytes.saturating_sub(previous) + size;
        }
        debug!("💾 {} guardado en caché durable: {} ({} bytes)", group, key, size);
        Ok(true)
    }

    /// Lee `key` de `group`.
    ///
    /// Los registros expirados o ilegibles se borran y se reportan como
    /// ausentes.
    pub async fn get_from_cache<T: DeserializeOwned>(
        &self,
        key: &str,
        group: CacheGroup,
    ) -> Result<Option<T>, CacheError> {
        if group.is_memory_only() {
            let map_key = key.to_string();
            let Some(value) = self.search_memory.get(&map_key).0 else {
                return Ok(None);
            };
            return match serde_json::from_value(value) {
                Ok(data) => Ok(Some(data)),
                Err(e) => {
                    warn!("⚠️ Descartando entrada ilegible en memoria {}: {}", key, e);
                    self.search_memory.remove(&map_key);
                    Ok(None)
                }
            };
        }

        let full_key = group.durable_key(key);
        let Some(raw) = self.store.get(&full_key).await? else {
            return Ok(None);
        };

        let record = match serde_json::from_str::<PersistentCacheRecord>(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("⚠️ Removiendo registro corrupto {}: {}", full_key, e);
                self.remove_tracked(&full_key, raw.len()).await?;
                return Ok(None);
            }
        };

        if record.is_expired(now_millis(), Some(group)) {
            debug!("⌛ Registro de caché expirado: {}", full_key);
            self.remove_tracked(&full_key, raw.len()).await?;
            return Ok(None);
        }

        match serde_json::from_value(record.data) {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                warn!("⚠️ Removiendo registro {} con formato inesperado: {}", full_key, e);
                self.remove_tracked(&full_key, raw.len()).await?;
                Ok(None)
            }
        }
    }

    /// Respaldo por cantidad: si hay más de `max_durable_entries` entradas
    /// durables, conserva solo las `retained_durable_entries` más recientes.
    pub async fn clear_old_cache_entries(&self) -> Result<usize, CacheError> {
        let entries = scan_entries(self.store.as_ref(), CACHE_KEY_PREFIX).await?;
        if entries.len() <= self.max_durable_entries {
            return Ok(0);
        }

        let removed = self
            .retain_most_recent(entries, self.retained_durable_entries)
            .await?;
        info!("🧹 Límite por cantidad removió {} entradas antiguas", removed);
        Ok(removed)
    }

    /// Elimina todas las entradas de `group`.
    pub async fn invalidate_group(&self, group: CacheGroup) -> Result<usize, CacheError> {
        if group.is_memory_only() {
            let removed = self.search_memory.len();
            self.search_memory.clear();
            return Ok(removed);
        }

        let entries = scan_entries(self.store.as_ref(), &group.key_prefix()).await?;
        let bytes: u64 = entries.iter().map(|entry| entry.size_bytes).sum();
        let keys: Vec<String> = entries.into_iter().map(|entry| entry.key).collect();
        self.store.multi_remove(&keys).await?;

        let mut aggregate = self.aggregate.lock();
        aggregate.bytes = aggregate.bytes.saturating_sub(bytes);
        info!("🗑️ Invalidadas {} entradas del grupo {}", keys.len(), group);
        Ok(keys.len())
    }

    /// Elimina todas las entradas del caché, en memoria y durables. Las claves
    /// de metadata se conservan.
    pub async fn clear_all(&self) -> Result<usize, CacheError> {
        let memory = self.search_memory.len();
        self.search_memory.clear();

        let keys = self.keys_with_prefix(CACHE_KEY_PREFIX).await?;
        self.store.multi_remove(&keys).await?;

        self.aggregate.lock().reset(0);
        Ok(memory + keys.len())
    }

    pub async fn stats(&self) -> Result<ApiCacheStats, CacheError> {
        let entries = scan_entries(self.store.as_ref(), CACHE_KEY_PREFIX).await?;
        let mut stats = ApiCacheStats {
            memory_entries: self.search_memory.len(),
            ..ApiCacheStats::default()
        };

        for entry in entries {
            stats.durable_entries += 1;
            stats.durable_bytes += entry.size_bytes;
            if entry.record.is_none() {
                stats.corrupt_entries += 1;
            }
            if let Some(group) = entry.group {
                *stats.entries_by_group.entry(group).or_default() += 1;
            }
        }
        Ok(stats)
    }

    /// Inicializa el contador de tamaño con lo que ya contiene el almacén
    /// durable.
    ///
    /// El momento de la última limpieza sale del marcador de mantenimiento si
    /// existe. Retorna el total de bytes contabilizado.
    pub async fn load_aggregate(&self) -> Result<u64, CacheError> {
        let entries = scan_entries(self.store.as_ref(), CACHE_KEY_PREFIX).await?;
        let bytes: u64 = entries.iter().map(|entry| entry.size_bytes).sum();
        let last_cleanup = self
            .store
            .get(META_LAST_CLEANUP_KEY)
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(|at| {
                let age = u64::try_from(now_millis().saturating_sub(at)).unwrap_or(0);
                Instant::now().checked_sub(Duration::from_millis(age))
            });

        let mut aggregate = self.aggregate.lock();
        aggregate.bytes = bytes;
        if let Some(at) = last_cleanup {
            aggregate.last_cleanup = at;
        }
        debug!("📏 El caché durable ocupa {} bytes", bytes);
        Ok(bytes)
    }

    /// Estimación actual del tamaño del caché durable en bytes.
    pub fn tracked_bytes(&self) -> u64 {
        self.aggregate.lock().bytes
    }

    fn needs_group_cleanup(&self, incoming: u64) -> bool {
        let aggregate = self.aggregate.lock();
        let stale = aggregate
            .last_cleanup
            .map_or(true, |at| at.elapsed() > self.aggregate_cleanup_interval);
        aggregate.bytes + incoming > self.max_aggregate_bytes || stale
    }

    async fn remove_tracked(&self, key: &str, raw_len: usize) -> Result<(), StoreError> {
        self.store.remove(key).await?;
        let mut aggregate = self.aggregate.lock();
        aggregate.bytes = aggregate.bytes.saturating_sub((key.len() + raw_len) as u64);
        Ok(())
    }

    /// Elimina las entradas expiradas y corruptas de `group`, y luego las más
    /// antiguas mientras el total durable supere el umbral agregado.
    async fn cleanup_group(&self, group: CacheGroup) -> Result<usize, CacheError> {
        let entries = scan_entries(self.store.as_ref(), CACHE_KEY_PREFIX).await?;
        let now = now_millis();
        let mut total: u64 = entries.iter().map(|entry| entry.size_bytes).sum();

        let mut doomed = Vec::new();
        let mut survivors = Vec::new();
        for entry in entries.into_iter().filter(|entry| entry.group == Some(group)) {
            match &entry.record {
                Some(record) if !record.is_expired(now, Some(group)) => {
                    survivors.push((record.timestamp, entry.key, entry.size_bytes))
                }
                _ => {
                    total -= entry.size_bytes;
                    doomed.push(entry.key);
                }
            }
        }

        let target = (self.max_aggregate_bytes as f64 * self.prune_target_ratio) as u64;
        survivors.sort_by_key(|(timestamp, _, _)| *timestamp);
        for (_, key, size) in survivors {
            if total <= target {
                break;
            }
            total -= size;
            doomed.push(key);
        }

        self.store.multi_remove(&doomed).await?;

        self.aggregate.lock().reset(total);
        info!(
            "🧹 Limpieza del grupo {}: {} entradas removidas, {} bytes contabilizados",
            group,
            doomed.len(),
            total
        );
        Ok(doomed.len())
    }

    /// Limpieza tras un fallo por almacenamiento lleno: se eliminan todas las
    /// entradas durables.
    async fn force_full_cleanup(&self) -> Result<usize, CacheError> {
        let keys = self.keys_with_prefix(CACHE_KEY_PREFIX).await?;
        self.store.multi_remove(&keys).await?;

        self.aggregate.lock().reset(0);
        info!("🧹 Limpieza forzada removió {} entradas", keys.len());
        Ok(keys.len())
    }

    async fn retain_most_recent(
        &self,
        mut entries: Vec<ScannedEntry>,
        keep: usize,
    ) -> Result<usize, CacheError> {
        // Los registros ilegibles se ordenan como los más antiguos.
        entries.sort_by_key(|entry| {
            std::cmp::Reverse(entry.record.as_ref().map_or(i64::MIN, |record| record.timestamp))
        });
        let doomed: Vec<String> = entries
            .into_iter()
            .skip(keep)
            .map(|entry| entry.key)
            .collect();
        self.store.multi_remove(&doomed).await?;
        Ok(doomed.len())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .all_keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(prefix))
            .collect())
    }
}
