use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::StoreError;

/// Mapa durable de string a string compartido por los cachés persistentes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    async fn multi_remove(&self, keys: &[String]) -> Result<(), StoreError>;

    async fn all_keys(&self) -> Result<Vec<String>, StoreError>;
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

/// Rechaza una escritura que dejaría el almacén por encima de su cuota.
fn check_quota(
    capacity: Option<usize>,
    used: usize,
    previous: usize,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    if let Some(capacity) = capacity {
        let projected = used.saturating_sub(previous) + entry_size(key, value);
        if projected > capacity {
            return Err(StoreError::Full {
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

/// Almacén en memoria, con límite opcional en bytes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
    capacity_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity_bytes: Some(capacity_bytes),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn used_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry_size(entry.key(), entry.value()))
            .sum()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|value| value.clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let previous = self
            .entries
            .get(key)
            .map(|old| entry_size(key, &old))
            .unwrap_or(0);
        check_quota(self.capacity_bytes, self.used_bytes(), previous, key, &value)?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.iter().map(|entry| entry.key().clone()).collect())
    }
}

/// Almacén persistido como un único documento JSON en el directorio de datos.
///
/// Cada cambio reescribe el documento mediante un archivo temporal y un rename,
/// así un crash deja en disco la versión vieja o la nueva.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
    capacity_bytes: Option<usize>,
}

impl JsonFileStore {
    pub const FILE_NAME: &'static str = "cache_store.json";

    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(Self::FILE_NAME);

        let entries = match fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("⚠️ Archivo de almacén corrupto {}, iniciando vacío: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!("📁 Almacén abierto en {} ({} claves)", path.display(), entries.len());

        Ok(Self {
            path,
            entries: Mutex::new(entries),
            capacity_bytes: None,
        })
    }

    pub fn with_capacity(mut self, capacity_bytes: usize) -> Self {
        self.capacity_bytes = Some(capacity_bytes);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let content = serde_json::to_string(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        let used: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        let previous = entries.get(key).map(|old| entry_size(key, old)).unwrap_or(0);
        check_quota(self.capacity_bytes, used, previous, key, &value)?;

        let old = entries.insert(key.to_string(), value);
        if let Err(e) = self.persist(&entries).await {
            // Mantener memoria y disco consistentes.
            match old {
                Some(old) => entries.insert(key.to_string(), old),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn multi_remove(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        for key in keys {
            entries.remove(key);
        }
        if entries.len() != before {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_quota() {
        let store = MemoryStore::with_capacity(10);
        store.set("a", "12345".into()).await.unwrap();
        let err = store.set("b", "123456".into()).await.unwrap_err();
        assert!(err.is_full());

        // Sobrescribir reutiliza el espacio de la entrada anterior.
        store.set("a", "123456789".into()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("123456789"));
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = JsonFileStore::open(dir.path()).await?;
            store.set("api_cache:album:1", "{}".into()).await?;
            store.set("api_cache:album:2", "{}".into()).await?;
            store.multi_remove(&["api_cache:album:2".to_string()]).await?;
        }

        let store = JsonFileStore::open(dir.path()).await?;
        assert_eq!(store.all_keys().await?, vec!["api_cache:album:1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_json_store_recovers_from_corrupt_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(JsonFileStore::FILE_NAME), "{not json").await?;

        let store = JsonFileStore::open(dir.path()).await?;
        assert!(store.all_keys().await?.is_empty());
        store.set("k", "v".into()).await?;
        assert_eq!(store.get("k").await?.as_deref(), Some("v"));
        Ok(())
    }

    #[tokio::test]
    async fn test_json_store_quota_is_enforced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = JsonFileStore::open(dir.path()).await?.with_capacity(8);
        store.set("k", "1234".into()).await?;
        assert!(store.set("k2", "12345".into()).await.unwrap_err().is_full());
        assert_eq!(store.get("k2").await?, None);
        Ok(())
    }
}
