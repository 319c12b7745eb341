use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use super::endpoints::{Endpoint, EndpointSet};
use super::response::{parse_search, parse_stream};
use super::transport::{HttpTransport, UpstreamRequest};
use super::{AudioQuality, SearchPage, StreamResolver, TrackRef};
use crate::cache::ResultCache;
use crate::config::UpstreamConfig;
use crate::error::{ResolveError, Result};
use crate::events::{EventBus, ResolverEvent};

/// Resolución de búsquedas y URLs de stream contra los mirrors de Tidal.
///
/// Las lecturas consultan primero el caché. En un miss el cliente recorre su
/// set de endpoints desde el índice de rotación compartido, avanzándolo tras
/// cada mirror que falla.
pub struct TidalClient {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<ResultCache>,
    search_endpoints: EndpointSet,
    stream_endpoints: EndpointSet,
    backup: Endpoint,
    required_quality: AudioQuality,
    search_timeout: Duration,
    stream_timeout: Duration,
    rotation_delay: Duration,
    events: EventBus,
}

impl TidalClient {
    pub fn new(
        config: &UpstreamConfig,
        required_quality: AudioQuality,
        transport: Arc<dyn HttpTransport>,
        cache: Arc<ResultCache>,
        events: EventBus,
    ) -> Result<Self> {
        Ok(Self {
            transport,
            cache,
            search_endpoints: EndpointSet::new(&config.search_endpoints)?,
            stream_endpoints: EndpointSet::new(&config.stream_endpoints)?,
            backup: Endpoint::parse(&config.backup_stream_endpoint)?,
            required_quality,
            search_timeout: config.search_timeout(),
            stream_timeout: config.stream_timeout(),
            rotation_delay: config.rotation_delay(),
            events,
        })
    }

    pub fn required_quality(&self) -> AudioQuality {
        self.required_quality
    }

    pub fn search_endpoints(&self) -> &EndpointSet {
        &self.search_endpoints
    }

    pub fn stream_endpoints(&self) -> &EndpointSet {
        &self.stream_endpoints
    }

    /// Busca tracks que cumplan la calidad requerida.
    ///
    /// Una página en caché se retorna sin tocar la red, sea cual sea su edad,
    /// mientras no haya expirado.
    pub async fn resolve_search(&self, query: &str) -> Result<SearchPage> {
        if let Some(page) = self.cache.get_cached_search_results(query) {
            let page = page.filtered(self.required_quality);
            self.events.emit(ResolverEvent::SearchResolved {
                query: query.to_string(),
                results: page.tracks.len(),
                from_cache: true,
            });
            return Ok(page);
        }

        info!("🔍 Buscando en mirrors de Tidal: '{}'", query);
        let page = self
            .with_rotation(
                &self.search_endpoints,
                self.search_timeout,
                |endpoint| endpoint.search_url(query),
                parse_search,
            )
            .await?
            .filtered(self.required_quality);

        info!(
            "✅ Búsqueda '{}' retornó {} tracks en {} o mejor",
            query,
            page.tracks.len(),
            self.required_quality
        );
        self.cache.cache_search_results(query, page.clone());
        self.events.emit(ResolverEvent::SearchResolved {
            query: query.to_string(),
            results: page.tracks.len(),
            from_cache: false,
        });
        Ok(page)
    }

    /// Resuelve una URL reproducible, usando el endpoint de respaldo cuando se
    /// agotan los mirrors de stream.
    pub async fn resolve_stream_url(&self, track: &TrackRef, quality: AudioQuality) -> Result<String> {
        let source_key = track.source_key(quality);
        if let Some(url) = self.cache.get_cached_streaming_url(&source_key) {
            self.events.emit(ResolverEvent::StreamResolved {
                source_key,
                from_cache: true,
            });
            return Ok(url);
        }

        let primary = self
            .with_rotation(
                &self.stream_endpoints,
                self.stream_timeout,
                |endpoint| endpoint.stream_url(track, quality),
                parse_stream,
            )
            .await;

        let url = match primary {
            Ok(url) => url,
            Err(primary_error) => {
                warn!(
                    "🔄 Mirrors de stream agotados para {} ({}), probando respaldo {}",
                    source_key,
                    primary_error,
                    self.backup.base()
                );
                self.events.emit(ResolverEvent::BackupEndpointUsed {
                    track_id: track.id.clone(),
                });
                self.fetch_backup(track, quality).await.map_err(|last| {
                    error!("❌ Track {} no disponible: {}", source_key, last);
                    ResolveError::Unavailable {
                        track: track.id.clone(),
                        last: Box::new(last),
                    }
                })?
            }
        };

        self.cache.cache_streaming_url(&source_key, url.clone());
        self.events.emit(ResolverEvent::StreamResolved {
            source_key,
            from_cache: false,
        });
        Ok(url)
    }

    async fn fetch_backup(&self, track: &TrackRef, quality: AudioQuality) -> Result<String> {
        let url = self.backup.stream_url(track, quality)?;
        let body = self
            .transport
            .get_json(UpstreamRequest::new(url, self.stream_timeout))
            .await?;
        parse_stream(self.backup.base(), body)
    }

    /// Prueba cada endpoint de `endpoints` exactamente una vez, empezando donde
    /// estaba el índice compartido al iniciar la llamada. Una respuesta que no
    /// se puede parsear cuenta como intento fallido.
    async fn with_rotation<T>(
        &self,
        endpoints: &EndpointSet,
        timeout: Duration,
        build: impl Fn(&Endpoint) -> Result<Url>,
        parse: impl Fn(&str, Value) -> Result<T>,
    ) -> Result<T> {
        let attempts = endpoints.len();
        let mut last_error = ResolveError::NoEndpoints;

        for (attempt, (index, endpoint)) in (1..=attempts).zip(endpoints.walk()) {
            let outcome = match build(endpoint) {
                Ok(url) => match self
                    .transport
                    .get_json(UpstreamRequest::new(url, timeout))
                    .await
                {
                    Ok(body) => parse(endpoint.base(), body),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => {
                    debug!("Endpoint {} respondió en el intento {}", endpoint.base(), attempt);
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        "⚠️ Intento {}/{} en {} falló: {}",
                        attempt,
                        attempts,
                        endpoint.base(),
                        e
                    );
                    self.events.emit(ResolverEvent::EndpointFailed {
                        endpoint: endpoint.base().to_string(),
                        attempt,
                        error: e.to_string(),
                    });
                    endpoints.rotate_from(index);
                    last_error = e;

                    if attempt < attempts {
                        tokio::time::sleep(self.rotation_delay).await;
                    }
                }
            }
        }

        Err(ResolveError::Exhausted {
            attempts,
            last: Box::new(last_error),
        })
    }
}

#[async_trait]
impl StreamResolver for TidalClient {
    async fn resolve_stream_url(&self, track: &TrackRef, quality: AudioQuality) -> Result<String> {
        TidalClient::resolve_stream_url(self, track, quality).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResultCacheConfig;
    use crate::sources::transport::MockHttpTransport;
    use crate::sources::{EndpointConfig, EndpointShape};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn upstream() -> UpstreamConfig {
        UpstreamConfig {
            search_endpoints: vec![
                EndpointConfig::new("https://a.example", EndpointShape::QueryParam),
                EndpointConfig::new("https://b.example", EndpointShape::PathSegment),
                EndpointConfig::new("https://c.example", EndpointShape::UrlParam),
            ],
            stream_endpoints: vec![
                EndpointConfig::new("https://s1.example", EndpointShape::QueryParam),
                EndpointConfig::new("https://s2.example", EndpointShape::PathSegment),
            ],
            backup_stream_endpoint: EndpointConfig::new(
                "https://backup.example",
                EndpointShape::QueryParam,
            ),
            ..UpstreamConfig::default()
        }
    }

    fn client(transport: MockHttpTransport) -> TidalClient {
        TidalClient::new(
            &upstream(),
            AudioQuality::Lossless,
            Arc::new(transport),
            Arc::new(ResultCache::new(&ResultCacheConfig::default())),
            EventBus::default(),
        )
        .unwrap()
    }

    fn host(request: &UpstreamRequest) -> String {
        request.url.host_str().unwrap_or_default().to_string()
    }

    fn server_error(request: &UpstreamRequest) -> ResolveError {
        ResolveError::Status {
            endpoint: request.endpoint(),
            status: 500,
        }
    }

    fn two_tier_body() -> Value {
        json!({
            "items": [
                { "id": 1, "title": "Lossless", "audioQuality": "LOSSLESS" },
                { "id": 2, "title": "Lossy", "audioQuality": "HIGH" }
            ],
            "totalNumberOfItems": 2
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_filters_quality_and_moves_index() {
        let mut transport = MockHttpTransport::new();
        transport.expect_get_json().times(2).returning(|request| {
            if host(&request) == "a.example" {
                Err(server_error(&request))
            } else {
                Ok(two_tier_body())
            }
        });
        let client = client(transport);

        let page = client.resolve_search("daft punk").await.unwrap();

        assert_eq!(page.tracks.len(), 1);
        assert_eq!(page.tracks[0].title, "Lossless");
        assert_eq!(page.total, 2);
        assert_eq!(client.search_endpoints().current_index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_order_persists_across_calls() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&visited);

        let mut transport = MockHttpTransport::new();
        transport.expect_get_json().returning(move |request| {
            let host = host(&request);
            log.lock().push(host.clone());
            let first_call = log.lock().len() <= 2;
            if host == "a.example" && first_call {
                Err(server_error(&request))
            } else {
                Ok(two_tier_body())
            }
        });
        let client = client(transport);

        client.resolve_search("first").await.unwrap();
        client.resolve_search("second").await.unwrap();

        // La segunda llamada empieza donde la dejó la primera.
        assert_eq!(*visited.lock(), vec!["a.example", "b.example", "b.example"]);
        assert_eq!(client.search_endpoints().current_index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_tries_each_mirror_once() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&visited);

        let mut transport = MockHttpTransport::new();
        transport.expect_get_json().returning(move |request| {
            log.lock().push(host(&request));
            Err(server_error(&request))
        });
        let client = client(transport);

        let started = tokio::time::Instant::now();
        let err = client.resolve_search("nothing").await.unwrap_err();

        assert!(matches!(err, ResolveError::Exhausted { attempts: 3, .. }));
        assert_eq!(*visited.lock(), vec!["a.example", "b.example", "c.example"]);
        // Dos esperas de rotación, ninguna tras el último intento.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(1100));
        assert_eq!(client.search_endpoints().current_index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_calls_each_try_every_mirror_once() {
        let visited: Arc<Mutex<Vec<(&'static str, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&visited);

        let mut transport = MockHttpTransport::new();
        transport.expect_get_json().returning(move |request| {
            let track = if request.url.as_str().contains("111") { "111" } else { "222" };
            log.lock().push((track, host(&request)));
            Err(server_error(&request))
        });

        let mut config = upstream();
        config.stream_endpoints = config.search_endpoints.clone();
        let client = TidalClient::new(
            &config,
            AudioQuality::Lossless,
            Arc::new(transport),
            Arc::new(ResultCache::new(&ResultCacheConfig::default())),
            EventBus::default(),
        )
        .unwrap();

        // La segunda llamada empieza a mitad de la rotación de la primera.
        let first_track = TrackRef::new("111");
        let first = client.resolve_stream_url(&first_track, AudioQuality::Lossless);
        let second = async {
            tokio::time::sleep(Duration::from_millis(600)).await;
            client
                .resolve_stream_url(&TrackRef::new("222"), AudioQuality::Lossless)
                .await
        };
        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap_err().is_unavailable());
        assert!(second.unwrap_err().is_unavailable());

        for track in ["111", "222"] {
            let mut hosts: Vec<String> = visited
                .lock()
                .iter()
                .filter(|(id, _)| *id == track)
                .map(|(_, host)| host.clone())
                .collect();
            assert_eq!(hosts.pop().as_deref(), Some("backup.example"), "{}", track);
            hosts.sort();
            assert_eq!(hosts, vec!["a.example", "b.example", "c.example"], "{}", track);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_search_skips_network() {
        let mut transport = MockHttpTransport::new();
        transport
            .expect_get_json()
            .times(1)
            .returning(|_| Ok(two_tier_body()));
        let client = client(transport);

        let first = client.resolve_search("Daft Punk").await.unwrap();
        let second = client.resolve_search("daft  punk").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_field_tolerance_and_caching() {
        let mut transport = MockHttpTransport::new();
        transport
            .expect_get_json()
            .times(1)
            .withf(|request| request.url.as_str().contains("quality=LOSSLESS"))
            .returning(|_| Ok(json!({ "sources": [{ "url": "https://cdn.example/42.flac" }] })));
        let client = client(transport);
        let track = TrackRef::new("42");

        let url = client
            .resolve_stream_url(&track, AudioQuality::Lossless)
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example/42.flac");

        let again = client
            .resolve_stream_url(&track, AudioQuality::Lossless)
            .await
            .unwrap();
        assert_eq!(again, url);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_endpoint_after_mirrors_fail() {
        let mut transport = MockHttpTransport::new();
        transport.expect_get_json().times(3).returning(|request| {
            if host(&request) == "backup.example" {
                Ok(json!({ "directUrl": "https://cdn.example/backup.flac" }))
            } else {
                Err(ResolveError::Timeout {
                    endpoint: request.endpoint(),
                })
            }
        });
        let client = client(transport);
        let events = client.events.subscribe();

        let url = client
            .resolve_stream_url(&TrackRef::new("7"), AudioQuality::Lossless)
            .await
            .unwrap();
        assert_eq!(url, "https://cdn.example/backup.flac");
        assert!(events.drain().any(|event| event
            == ResolverEvent::BackupEndpointUsed {
                track_id: "7".into()
            }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_failure_reports_unavailable() {
        let mut transport = MockHttpTransport::new();
        transport
            .expect_get_json()
            .times(3)
            .returning(|_| Ok(json!({ "message": "not found" })));
        let client = client(transport);

        let err = client
            .resolve_stream_url(&TrackRef::new("9"), AudioQuality::HiResLossless)
            .await
            .unwrap_err();

        assert!(err.is_unavailable());
        assert!(!err.is_rate_limit());
        assert_eq!(err.user_message(), "Playback unavailable");
        assert!(!client.cache.has_streaming_url("9:HI_RES_LOSSLESS"));
    }
}
