use anyhow::Context;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ApiCacheManager, CacheInitializer, MaintenanceReport, ResultCache};
use crate::config::Config;
use crate::error::Result;
use crate::events::{EventBus, ResolverEvent};
use crate::preload::PreloadScheduler;
use crate::sources::{
    AudioQuality, HttpTransport, SearchPage, StreamResolver, TidalClient, TrackRef,
};
use crate::storage::KeyValueStore;

/// Dueño de larga vida de todo el pipeline.
///
/// Se construye una vez al arrancar; todos los llamadores pasan por este handle
/// en lugar de usar estado global del proceso.
pub struct TidalService {
    config: Config,
    result_cache: Arc<ResultCache>,
    client: Arc<TidalClient>,
    preload: Arc<PreloadScheduler>,
    api_cache: ApiCacheManager,
    initializer: CacheInitializer,
    events: EventBus,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TidalService {
    pub fn new(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn HttpTransport>,
    ) -> anyhow::Result<Self> {
        let events = EventBus::default();
        let shutdown = CancellationToken::new();
        let result_cache = Arc::new(ResultCache::new(&config.result_cache));

        let client = Arc::new(
            TidalClient::new(
                &config.upstream,
                config.required_quality,
                transport,
                Arc::clone(&result_cache),
                events.clone(),
            )
            .context("Invalid upstream endpoint configuration")?,
        );

        let preload = Arc::new(PreloadScheduler::new(
            &config.preload,
            config.required_quality,
            Arc::clone(&client) as Arc<dyn StreamResolver>,
            Arc::clone(&result_cache),
            events.clone(),
            shutdown.child_token(),
        ));

        let api_cache = ApiCacheManager::new(Arc::clone(&store), &config.api_cache);
        let initializer = CacheInitializer::new(store, config.cache_version.clone(), &config.api_cache);

        Ok(Self {
            config,
            result_cache,
            client,
            preload,
            api_cache,
            initializer,
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Ejecuta el mantenimiento del caché y arranca las limpiezas en segundo
    /// plano.
    ///
    /// Los fallos de mantenimiento se registran y nunca son fatales: el
    /// pipeline funciona con un caché sucio o vacío.
    pub async fn start(&self) -> MaintenanceReport {
        let report = match self.initializer.initialize().await {
            Ok(report) => report,
            Err(e) => {
                warn!("⚠️ Falló el mantenimiento del caché, continuando: {}", e);
                MaintenanceReport::default()
            }
        };

        if let Err(e) = self.api_cache.clear_old_cache_entries().await {
            warn!("⚠️ Falló el límite por cantidad del caché, continuando: {}", e);
        }

        if let Err(e) = self.api_cache.load_aggregate().await {
            warn!("⚠️ No se pudo medir el caché durable, continuando: {}", e);
        }

        let mut tasks = self.tasks.lock();
        tasks.push(
            self.result_cache
                .start_cleanup_task(self.shutdown.child_token()),
        );
        tasks.push(self.start_temp_cache_sweeper());

        info!("🚀 Tidal resolver iniciado ({} requerida)", self.config.required_quality);
        report
    }

    /// Búsqueda nueva: resetea la precarga, resuelve y encola los resultados
    /// por ranking para precargar los primeros.
    pub async fn search(&self, query: &str) -> Result<SearchPage> {
        if query.trim().is_empty() {
            return Ok(SearchPage {
                tracks: Vec::new(),
                total: 0,
                has_more: false,
            });
        }

        self.preload.reset_for_new_search();
        let page = self.client.resolve_search(query).await?;

        for (rank, track) in page.tracks.iter().enumerate() {
            self.preload.enqueue(track, rank as u32);
        }
        Ok(page)
    }

    /// URL reproducible de `track`; una URL precargada se sirve desde el caché.
    pub async fn stream_url(&self, track: &TrackRef, quality: AudioQuality) -> Result<String> {
        self.client.resolve_stream_url(track, quality).await
    }

    pub fn events(&self) -> flume::Receiver<ResolverEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &TidalClient {
        &self.client
    }

    pub fn preload(&self) -> &Arc<PreloadScheduler> {
        &self.preload
    }

    pub fn result_cache(&self) -> &Arc<ResultCache> {
        &self.result_cache
    }

    pub fn api_cache(&self) -> &ApiCacheManager {
        &self.api_cache
    }

    pub fn initializer(&self) -> &CacheInitializer {
        &self.initializer
    }

    /// Cancela todas las tareas en segundo plano y espera a que terminen.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Tarea en segundo plano terminó de forma anormal: {}", e);
            }
        }
        self.preload.wait_until_idle().await;
        info!("👋 Tidal resolver detenido");
    }

    fn start_temp_cache_sweeper(&self) -> JoinHandle<()> {
        let preload = Arc::clone(&self.preload);
        let shutdown = self.shutdown.child_token();
        let period = self.config.result_cache.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = preload.sweep_expired();
                        if removed > 0 {
                            debug!("🧹 Removidos {} tracks diferidos expirados", removed);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheGroup;
    use crate::sources::transport::MockHttpTransport;
    use crate::storage::MemoryStore;
    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    fn search_body() -> serde_json::Value {
        json!({
            "items": (1..=5)
                .map(|id| json!({ "id": id, "title": format!("Song {}", id), "audioQuality": "LOSSLESS" }))
                .collect::<Vec<_>>(),
            "totalNumberOfItems": 5
        })
    }

    fn service(requests: Arc<SyncMutex<Vec<String>>>) -> TidalService {
        let mut transport = MockHttpTransport::new();
        transport.expect_get_json().returning(move |request| {
            let host = request.url.host_str().unwrap_or_default().to_string();
            requests.lock().push(request.url.to_string());
            if host.starts_with("search-") {
                Ok(search_body())
            } else {
                let id = request
                    .url
                    .query_pairs()
                    .find(|(name, _)| name == "id")
                    .map(|(_, value)| value.into_owned())
                    .unwrap_or_default();
                Ok(json!({ "url": format!("https://cdn.example/{}.flac", id) }))
            }
        });

        TidalService::new(
            Config::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(transport),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_preloads_top_results() {
        let requests = Arc::new(SyncMutex::new(Vec::new()));
        let service = service(Arc::clone(&requests));
        service.start().await;

        let page = service.search("daft punk").await.unwrap();
        assert_eq!(page.tracks.len(), 5);

        service.preload().wait_until_idle().await;
        let status = service.preload().status();
        assert_eq!(status.resolved_this_batch, 3);
        assert_eq!(status.deferred, 2);

        let before = requests.lock().len();
        let url = service
            .stream_url(&TrackRef::new("1"), AudioQuality::Lossless)
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example/1.flac");
        assert_eq!(requests.lock().len(), before);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_query_makes_no_request() {
        let requests = Arc::new(SyncMutex::new(Vec::new()));
        let service = service(Arc::clone(&requests));

        let page = service.search("   ").await.unwrap();
        assert!(page.tracks.is_empty());
        assert!(requests.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_writes_cache_version() {
        let store = Arc::new(MemoryStore::new());
        let service = TidalService::new(
            Config::default(),
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            Arc::new(MockHttpTransport::new()),
        )
        .unwrap();

        let report = service.start().await;
        assert!(report.version_reset);
        assert_eq!(
            store.get("cache_meta:version").await.unwrap().as_deref(),
            Some("\"1.0.0\"")
        );
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_measures_existing_durable_cache() {
        let store = Arc::new(MemoryStore::new());
        store.set("cache_meta:version", "\"1.0.0\"".into()).await.unwrap();
        let writer = ApiCacheManager::new(
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            &Config::default().api_cache,
        );
        writer
            .save_to_cache("1", &json!({ "title": "Discovery" }), CacheGroup::Album)
            .await
            .unwrap();

        let service = TidalService::new(
            Config::default(),
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            Arc::new(MockHttpTransport::new()),
        )
        .unwrap();
        service.start().await;

        let stats = service.api_cache().stats().await.unwrap();
        assert_eq!(stats.durable_entries, 1);
        assert_eq!(service.api_cache().tracked_bytes(), stats.durable_bytes);
        service.shutdown().await;
    }
}
