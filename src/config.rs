use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::sources::{AudioQuality, EndpointConfig, EndpointShape};

/// Prefijo de las variables de entorno, p. ej.
/// `TIDAL_RESOLVER__PRELOAD__TOP_N=5`.
pub const ENV_PREFIX: &str = "TIDAL_RESOLVER";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // Paths
    pub data_dir: PathBuf,

    /// Versión del esquema del caché durable; un cambio lo borra al arrancar
    pub cache_version: String,

    /// Calidad mínima conservada en búsquedas y pedida para streams
    pub required_quality: AudioQuality,

    pub result_cache: ResultCacheConfig,
    pub preload: PreloadConfig,
    pub upstream: UpstreamConfig,
    pub api_cache: ApiCacheConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResultCacheConfig {
    pub max_entries: usize,
    pub streaming_url_expiry_ms: u64,
    pub search_result_expiry_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PreloadConfig {
    /// Los resultados por debajo de este ranking van al caché temporal y no a
    /// la cola
    pub top_n: u32,
    pub max_preload_count: usize,
    pub max_requests_per_window: usize,
    pub window_duration_ms: u64,
    pub temp_cache_expiry_ms: u64,
    pub temp_cache_max_entries: usize,
    pub inter_job_delay_ms: u64,
    pub rate_limit_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub search_endpoints: Vec<EndpointConfig>,
    pub stream_endpoints: Vec<EndpointConfig>,
    pub backup_stream_endpoint: EndpointConfig,
    pub search_timeout_ms: u64,
    pub stream_timeout_ms: u64,
    pub rotation_delay_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiCacheConfig {
    // Escritura
    pub max_aggregate_bytes: usize,
    pub aggregate_cleanup_interval_ms: u64,
    pub search_memory_entries: usize,
    pub search_memory_expiry_ms: u64,

    // Límite por cantidad
    pub max_durable_entries: usize,
    pub retained_durable_entries: usize,

    // Mantenimiento al arrancar
    pub max_cache_size_mb: u64,
    pub cleanup_interval_hours: u64,
    pub prune_target_ratio: f64,
}

impl Config {
    /// Carga los valores por defecto, luego un archivo opcional
    /// `tidal-resolver.{toml,yaml,json}` y después las variables de entorno
    /// `TIDAL_RESOLVER__*`.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Config::default())?)
            .add_source(::config::File::with_name("tidal-resolver").required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;

        std::fs::create_dir_all(&config.data_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Valida que los valores de configuración sean correctos.
    ///
    /// # Reglas de validación
    ///
    /// - Tamaños de caché, ventanas y timeouts deben ser mayores que cero
    /// - Debe haber al menos un endpoint de búsqueda y uno de stream
    /// - La proporción objetivo de poda debe estar en `(0, 1]`
    /// - Las entradas conservadas no pueden superar el límite de entradas durables
    pub fn validate(&self) -> Result<()> {
        if self.cache_version.trim().is_empty() {
            anyhow::bail!("Cache version must not be empty");
        }

        if self.result_cache.max_entries == 0 {
            anyhow::bail!("Result cache max entries must be greater than 0");
        }

        if self.result_cache.sweep_interval_ms == 0 {
            anyhow::bail!("Result cache sweep interval must be greater than 0");
        }

        if self.preload.max_requests_per_window == 0 || self.preload.window_duration_ms == 0 {
            anyhow::bail!("Rate limit window must allow at least one request per non-zero window");
        }

        if self.preload.max_preload_count == 0 {
            anyhow::bail!("Max preload count must be greater than 0");
        }

        if self.upstream.search_endpoints.is_empty() {
            anyhow::bail!("At least one search endpoint is required");
        }

        if self.upstream.stream_endpoints.is_empty() {
            anyhow::bail!("At least one stream endpoint is required");
        }

        if self.upstream.search_timeout_ms == 0 || self.upstream.stream_timeout_ms == 0 {
            anyhow::bail!("Upstream timeouts must be greater than 0");
        }

        let ratio = self.api_cache.prune_target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            anyhow::bail!("Prune target ratio must be in (0, 1], got: {}", ratio);
        }

        if self.api_cache.retained_durable_entries > self.api_cache.max_durable_entries {
            anyhow::bail!(
                "Retained durable entries ({}) cannot exceed the durable cap ({})",
                self.api_cache.retained_durable_entries,
                self.api_cache.max_durable_entries
            );
        }

        Ok(())
    }

    /// Retorna un resumen de la configuración actual para el log.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Data: {} (cache v{})\n  \
            Quality: >= {}\n  \
            Result cache: {} entries, streams {}, searches {}\n  \
            Preload: top {}, {} per batch, {} req / {}\n  \
            Upstream: {} search, {} stream endpoints (+1 backup)\n  \
            API cache: {}MB ceiling, maintenance every {}h",
            self.data_dir.display(),
            self.cache_version,
            self.required_quality,
            self.result_cache.max_entries,
            humantime::format_duration(self.result_cache.streaming_url_expiry()),
            humantime::format_duration(self.result_cache.search_result_expiry()),
            self.preload.top_n,
            self.preload.max_preload_count,
            self.preload.max_requests_per_window,
            humantime::format_duration(self.preload.window_duration()),
            self.upstream.search_endpoints.len(),
            self.upstream.stream_endpoints.len(),
            self.api_cache.max_cache_size_mb,
            self.api_cache.cleanup_interval_hours,
        )
    }
}

impl ResultCacheConfig {
    pub fn streaming_url_expiry(&self) -> Duration {
        Duration::from_millis(self.streaming_url_expiry_ms)
    }

    pub fn search_result_expiry(&self) -> Duration {
        Duration::from_millis(self.search_result_expiry_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl PreloadConfig {
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_duration_ms)
    }

    pub fn temp_cache_expiry(&self) -> Duration {
        Duration::from_millis(self.temp_cache_expiry_ms)
    }

    pub fn inter_job_delay(&self) -> Duration {
        Duration::from_millis(self.inter_job_delay_ms)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }
}

impl UpstreamConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn rotation_delay(&self) -> Duration {
        Duration::from_millis(self.rotation_delay_ms)
    }
}

impl ApiCacheConfig {
    pub fn aggregate_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.aggregate_cleanup_interval_ms)
    }

    pub fn search_memory_expiry(&self) -> Duration {
        Duration::from_millis(self.search_memory_expiry_ms)
    }

    pub fn max_cache_size_bytes(&self) -> u64 {
        self.max_cache_size_mb * 1024 * 1024
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 60 * 60)
    }
}

/// Valores de configuración por defecto.
///
/// Son las constantes con las que se ajustó el pipeline; el rate limit en
/// particular refleja lo que el upstream tolera antes de bloquear un cliente.
impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            cache_version: "1.0.0".to_string(),
            required_quality: AudioQuality::Lossless,
            result_cache: ResultCacheConfig::default(),
            preload: PreloadConfig::default(),
            upstream: UpstreamConfig::default(),
            api_cache: ApiCacheConfig::default(),
        }
    }
}

impl Default for ResultCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 50,
            streaming_url_expiry_ms: 20 * 60 * 1000, // 20 minutos
            search_result_expiry_ms: 15 * 60 * 1000, // 15 minutos
            sweep_interval_ms: 5 * 60 * 1000,
        }
    }
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            top_n: 3,
            max_preload_count: 3,
            max_requests_per_window: 3,
            window_duration_ms: 60_000,
            temp_cache_expiry_ms: 10 * 60 * 1000, // 10 minutos
            temp_cache_max_entries: 50,
            inter_job_delay_ms: 200,
            rate_limit_backoff_ms: 30_000,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        // Mirrors de ejemplo; un despliegue real los sobrescribe desde el
        // archivo de configuración.
        Self {
            search_endpoints: vec![
                EndpointConfig::new("https://search-a.example.com", EndpointShape::QueryParam),
                EndpointConfig::new("https://search-b.example.com", EndpointShape::PathSegment),
                EndpointConfig::new("https://search-c.example.com", EndpointShape::UrlParam),
            ],
            stream_endpoints: vec![
                EndpointConfig::new("https://stream-a.example.com", EndpointShape::QueryParam),
                EndpointConfig::new("https://stream-b.example.com", EndpointShape::UrlParam),
            ],
            backup_stream_endpoint: EndpointConfig::new(
                "https://stream-backup.example.com",
                EndpointShape::QueryParam,
            ),
            search_timeout_ms: 20_000,
            stream_timeout_ms: 15_000,
            rotation_delay_ms: 500,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
        }
    }
}

impl Default for ApiCacheConfig {
    fn default() -> Self {
        Self {
            max_aggregate_bytes: 1024 * 1024, // 1MB
            aggregate_cleanup_interval_ms: 6 * 60 * 60 * 1000,
            search_memory_entries: 2,
            search_memory_expiry_ms: 2 * 60 * 1000,
            max_durable_entries: 20,
            retained_durable_entries: 10,
            max_cache_size_mb: 50,
            cleanup_interval_hours: 24,
            prune_target_ratio: 0.9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tuned_constants() {
        let config = Config::default();
        assert_eq!(config.preload.max_preload_count, 3);
        assert_eq!(config.preload.max_requests_per_window, 3);
        assert_eq!(config.preload.window_duration_ms, 60_000);
        assert_eq!(config.result_cache.streaming_url_expiry_ms, 1_200_000);
        assert_eq!(config.result_cache.search_result_expiry_ms, 900_000);
        assert_eq!(config.preload.temp_cache_expiry_ms, 600_000);
        assert_eq!(config.result_cache.max_entries, 50);
        assert_eq!(config.api_cache.max_cache_size_mb, 50);
        assert_eq!(config.api_cache.cleanup_interval_hours, 24);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.upstream.search_endpoints.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.api_cache.prune_target_ratio = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.api_cache.retained_durable_entries = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = serde_json::from_str(r#"{ "preload": { "top_n": 5 } }"#).unwrap();
        assert_eq!(config.preload.top_n, 5);
        assert_eq!(config.preload.max_preload_count, 3);
        assert_eq!(config.cache_version, "1.0.0");
    }

    #[test]
    fn test_summary_mentions_key_limits() {
        let summary = Config::default().summary();
        assert!(summary.contains("3 req / 1m"));
        assert!(summary.contains("50MB"));
    }
}
