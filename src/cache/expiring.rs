use dashmap::DashMap;
use std::{hash::Hash, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::debug;

/// Cache entry con expiración absoluta
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub cached_at: Instant,
    pub expires_at: Instant,
    /// Contador de hits para diagnóstico
    pub access_count: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            cached_at: now,
            expires_at: now + ttl,
            access_count: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Cómo se resolvió una consulta a [`ExpiringMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Hit,
    Miss,
    Expired,
}

/// Mapa acotado con expiración y desalojo en bloque.
///
/// Cuando llega una clave nueva y el mapa está lleno, la mitad más antigua (por
/// `cached_at`) se elimina de una vez.
#[derive(Debug)]
pub struct ExpiringMap<K: Clone + Eq + Hash, V> {
    data: Arc<DashMap<K, CacheEntry<V>>>,
    max_entries: usize,
    ttl: Duration,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            data: Arc::new(DashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Inserta o sobrescribe; retorna el número de entradas desalojadas antes.
    pub fn insert(&self, key: K, value: V) -> usize {
        let evicted = if !self.data.contains_key(&key) && self.data.len() >= self.max_entries {
            self.evict_oldest_half()
        } else {
            0
        };
        self.data.insert(key, CacheEntry::new(value, self.ttl));
        evicted
    }

    /// Retorna el valor si existe y está vigente, incrementando su contador de
    /// hits.
    ///
    /// Las entradas expiradas se eliminan en el acto, así las consultas
    /// repetidas siguen fallando.
    pub fn get(&self, key: &K) -> (Option<V>, Lookup) {
        if let Some(mut entry) = self.data.get_mut(key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(key);
                return (None, Lookup::Expired);
            }
            entry.access_count += 1;
            return (Some(entry.value.clone()), Lookup::Hit);
        }
        (None, Lookup::Miss)
    }

    /// Comprueba presencia vigente sin contar un hit.
    pub fn contains_fresh(&self, key: &K) -> bool {
        self.data
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    /// Copia de una entrada, expirada o no.
    pub fn entry(&self, key: &K) -> Option<CacheEntry<V>> {
        self.data.get(key).map(|entry| entry.clone())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.data.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Elimina las entradas expiradas y retorna cuántas se quitaron.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.data.len();
        self.data.retain(|_, entry| !entry.is_expired());
        let removed = before.saturating_sub(self.data.len());

        if removed > 0 {
            debug!("Limpiadas {} entradas expiradas del cache", removed);
        }
        removed
    }

    fn evict_oldest_half(&self) -> usize {
        let mut entries: Vec<(K, Instant)> = self
            .data
            .iter()
            .map(|entry| (entry.key().clone(), entry.cached_at))
            .collect();
        entries.sort_by_key(|(_, cached_at)| *cached_at);

        let count = entries.len() / 2;
        let mut evicted = 0;
        for (key, _) in entries.into_iter().take(count) {
            if self.data.remove(&key).is_some() {
                evicted += 1;
            }
        }

        debug!("Desalojadas {} entradas más antiguas del cache", evicted);
        evicted
    }
}

impl<K, V> Clone for ExpiringMap<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            max_entries: self.max_entries,
            ttl: self.ttl,
        }
    }
}
