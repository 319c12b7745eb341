use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use tidal_resolver::cache::CacheGroup;
use tidal_resolver::sources::{AudioQuality, ReqwestTransport, TrackRef};
use tidal_resolver::storage::{JsonFileStore, KeyValueStore};
use tidal_resolver::{Config, ResolverEvent, TidalService};

const USAGE: &str = "usage: tidal-resolver <search <query> | stream <track-id> [quality] | maintenance> [--health-check]";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tidal_resolver=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando tidal-resolver v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    let store = Arc::new(
        JsonFileStore::open(&config.data_dir)
            .await?
            .with_capacity(config.api_cache.max_cache_size_bytes() as usize),
    );
    let transport = Arc::new(ReqwestTransport::new(&config.upstream.user_agent)?);
    let service = Arc::new(TidalService::new(config, store, transport)?);

    let events = service.events();
    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            log_event(&event);
        }
    });

    service.start().await;

    let outcome = tokio::select! {
        outcome = run(&service, &args) => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("⚠️ Señal de shutdown recibida");
            Ok(())
        }
    };

    service.shutdown().await;
    logger.abort();
    outcome
}

async fn run(service: &TidalService, args: &[String]) -> Result<()> {
    match args.first().map(String::as_str) {
        Some("search") => {
            let query = args[1..].join(" ");
            match service.search(&query).await {
                Ok(page) => {
                    for (rank, track) in page.tracks.iter().enumerate() {
                        println!(
                            "{:>2}. [{}] {} - {} ({})",
                            rank + 1,
                            track.id,
                            track.artist_line(),
                            track.title,
                            track.quality
                        );
                    }
                    println!("{} shown, {} total", page.tracks.len(), page.total);
                    service
                        .api_cache()
                        .save_to_cache(&query, &page, CacheGroup::Search)
                        .await?;
                    service.preload().wait_until_idle().await;
                }
                Err(e) => {
                    error!("Error en la búsqueda: {}", e);
                    println!("{}", e.user_message());
                }
            }
        }
        Some("stream") => {
            let Some(id) = args.get(1) else {
                anyhow::bail!(USAGE);
            };
            let quality = match args.get(2) {
                Some(raw) => raw.parse::<AudioQuality>().map_err(anyhow::Error::msg)?,
                None => service.config().required_quality,
            };
            match service.stream_url(&TrackRef::new(id.as_str()), quality).await {
                Ok(url) => println!("{}", url),
                Err(e) => {
                    error!("Error resolviendo el stream: {}", e);
                    println!("{}", e.user_message());
                }
            }
        }
        Some("maintenance") => {
            let report = service.initializer().run_sweep().await?;
            let capped = service.api_cache().clear_old_cache_entries().await?;
            let stats = service.api_cache().stats().await?;
            println!(
                "removed {} entries ({} by count cap), {} entries / {} bytes remain",
                report.removed(),
                capped,
                stats.durable_entries,
                stats.durable_bytes
            );
        }
        _ => anyhow::bail!(USAGE),
    }
    Ok(())
}

fn log_event(event: &ResolverEvent) {
    match event {
        ResolverEvent::EndpointFailed {
            endpoint,
            attempt,
            error,
        } => info!("📡 {} falló en el intento {}: {}", endpoint, attempt, error),
        ResolverEvent::BackupEndpointUsed { track_id } => {
            info!("🛟 Endpoint de respaldo usado para el track {}", track_id)
        }
        ResolverEvent::RateLimitWait { wait } => {
            info!("⏳ Esperando {} por el presupuesto de peticiones", humantime::format_duration(*wait))
        }
        ResolverEvent::RateLimited { source_key, backoff } => info!(
            "🚦 {} limitado por rate limit, reintento en {}",
            source_key,
            humantime::format_duration(*backoff)
        ),
        other => tracing::debug!("{:?}", other),
    }
}

/// Verifica que el directorio de datos sea escribible y la configuración
/// válida.
async fn health_check(config: &Config) -> Result<()> {
    config.validate()?;
    let store = JsonFileStore::open(&config.data_dir).await?;
    store.set("cache_meta:health", "\"ok\"".to_string()).await?;
    store.remove("cache_meta:health").await?;
    println!("OK");
    Ok(())
}
