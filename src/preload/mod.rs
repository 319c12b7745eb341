//! Background resolution of stream URLs ahead of playback.
//!
//! Only the top-ranked tracks of a result set are queued; the long tail is
//! parked in a short-lived temp cache. A single worker drains the queue in
//! priority order under a global request budget and writes every resolved URL
//! into the shared [`ResultCache`].

pub mod policy;
pub mod rate_limit;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{ExpiringMap, ResultCache};
use crate::config::PreloadConfig;
use crate::error::Result;
use crate::events::{EventBus, ResolverEvent};
use crate::sources::{AudioQuality, StreamResolver, TrackRecord};

pub use policy::RetryPolicy;
pub use rate_limit::RateLimitWindow;

/// Petición en cola para resolver un track.
#[derive(Debug, Clone)]
pub struct PreloadJob {
    pub source_key: String,
    /// Menor es más urgente
    pub priority: u32,
    pub enqueued_at: Instant,
    pub track: TrackRecord,
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Ranking demasiado bajo; se guarda en el caché temporal
    Deferred,
    AlreadyResolved,
    /// El mismo source key ya está en cola o en curso
    Duplicate,
}

/// Estado instantáneo del scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadStatus {
    pub pending: usize,
    pub in_flight: Option<String>,
    pub resolved_this_batch: usize,
    pub processing: bool,
    pub deferred: usize,
    pub requests_in_window: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<PreloadJob>,
    in_flight: Option<String>,
    resolved_this_batch: usize,
    /// Se incrementa en cada reset; no se cuentan los jobs de generaciones
    /// anteriores
    generation: u64,
    processing: bool,
}

impl QueueState {
    fn contains(&self, source_key: &str) -> bool {
        self.in_flight.as_deref() == Some(source_key)
            || self.pending.iter().any(|job| job.source_key == source_key)
    }

    fn insert_by_priority(&mut self, job: PreloadJob) {
        let position = self
            .pending
            .iter()
            .position(|queued| queued.priority > job.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, job);
    }
}

enum Step {
    Next,
    Backoff(Duration),
}

pub struct PreloadScheduler {
    resolver: Arc<dyn StreamResolver>,
    cache: Arc<ResultCache>,
    temp_cache: ExpiringMap<String, TrackRecord>,
    state: Mutex<QueueState>,
    window: Mutex<RateLimitWindow>,
    idle: watch::Sender<bool>,
    quality: AudioQuality,
    top_n: u32,
    max_preload_count: usize,
    inter_job_delay: Duration,
    rate_limit_backoff: Duration,
    events: EventBus,
    shutdown: CancellationToken,
}

impl PreloadScheduler {
    pub fn new(
        config: &PreloadConfig,
        quality: AudioQuality,
        resolver: Arc<dyn StreamResolver>,
        cache: Arc<ResultCache>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            resolver,
            cache,
            temp_cache: ExpiringMap::new(config.temp_cache_max_entries, config.temp_cache_expiry()),
            state: Mutex::new(QueueState::default()),
            window: Mutex::new(RateLimitWindow::new(
                config.max_requests_per_window,
                config.window_duration(),
            )),
            idle,
            quality,
            top_n: config.top_n,
            max_preload_count: config.max_preload_count,
            inter_job_delay: config.inter_job_delay(),
            rate_limit_backoff: config.rate_limit_backoff(),
            events,
            shutdown,
        }
    }

    /// Admite un track para precarga, o lo aparca en el caché temporal cuando
    /// su ranking es `top_n` o peor.
    pub fn enqueue(self: &Arc<Self>, track: &TrackRecord, priority: u32) -> EnqueueOutcome {
        let source_key = track.stream_ref.source_key(self.quality);

        if priority >= self.top_n {
            self.temp_cache.insert(source_key.clone(), track.clone());
            debug!("📦 Diferido {} (prioridad {})", source_key, priority);
            self.events.emit(ResolverEvent::PreloadDeferred {
                source_key,
                priority,
            });
            return EnqueueOutcome::Deferred;
        }

        if self.cache.has_streaming_url(&source_key) {
            return EnqueueOutcome::AlreadyResolved;
        }

        let mut state = self.state.lock();
        if state.contains(&source_key) {
            return EnqueueOutcome::Duplicate;
        }

        let generation = state.generation;
        state.insert_by_priority(PreloadJob {
            source_key: source_key.clone(),
            priority,
            enqueued_at: Instant::now(),
            track: track.clone(),
            generation,
        });
        debug!("➕ {} en cola de precarga (prioridad {})", source_key, priority);
        self.events.emit(ResolverEvent::PreloadQueued {
            source_key,
            priority,
        });

        if !state.processing && !self.shutdown.is_cancelled() {
            state.processing = true;
            self.idle.send_replace(false);
            tokio::spawn(Arc::clone(self).drain());
        }

        EnqueueOutcome::Queued
    }

    /// Descarta los jobs pendientes y el contador del lote. Se conservan las
    /// URLs en caché y el presupuesto de peticiones; un job ya en curso termina
    /// y su resultado se cachea.
    pub fn reset_for_new_search(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            let discarded = state.pending.len();
            state.pending.clear();
            state.resolved_this_batch = 0;
            state.generation += 1;
            discarded
        };

        if discarded > 0 {
            info!("🔄 Cola de precarga reseteada, {} jobs pendientes descartados", discarded);
        }
        self.events.emit(ResolverEvent::PreloadReset { discarded });
        discarded
    }

    /// Track aparcado en el caché temporal bajo `source_key`.
    pub fn deferred_track(&self, source_key: &str) -> Option<TrackRecord> {
        self.temp_cache.get(&source_key.to_string()).0
    }

    /// URL de stream ya resuelta para `source_key`; nunca toca la red.
    pub fn preloaded_url(&self, source_key: &str) -> Option<String> {
        self.cache.get_cached_streaming_url(source_key)
    }

    pub fn quality(&self) -> AudioQuality {
        self.quality
    }

    pub fn status(&self) -> PreloadStatus {
        let requests_in_window = self.window.lock().request_count();
        let state = self.state.lock();
        PreloadStatus {
            pending: state.pending.len(),
            in_flight: state.in_flight.clone(),
            resolved_this_batch: state.resolved_this_batch,
            processing: state.processing,
            deferred: self.temp_cache.len(),
            requests_in_window,
        }
    }

    /// Termina cuando el loop de drenado se ha detenido.
    pub async fn wait_until_idle(&self) {
        let mut idle = self.idle.subscribe();
        // El sender vive tanto como `self`.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Elimina las entradas expiradas del caché temporal.
    pub fn sweep_expired(&self) -> usize {
        self.temp_cache.cleanup_expired()
    }

    async fn drain(self: Arc<Self>) {
        debug!("▶️ Loop de precarga iniciado");

        loop {
            if !self.has_work() {
                debug!("⏹️ Loop de precarga terminado");
                return;
            }

            let wait = self.window.lock().time_until_available();
            if let Some(wait) = wait {
                info!("⏳ Presupuesto de peticiones agotado, esperando {:?}", wait);
                self.events.emit(ResolverEvent::RateLimitWait { wait });
                if !self.pause(wait).await {
                    self.finish();
                    return;
                }
                continue;
            }

            let Some(job) = self.take_next() else {
                continue;
            };

            if self.cache.has_streaming_url(&job.source_key) {
                debug!("Omitiendo {}, ya resuelto", job.source_key);
                self.state.lock().in_flight = None;
                continue;
            }

            self.window.lock().record();
            debug!("🎯 Resolviendo {} (prioridad {})", job.source_key, job.priority);
            let result = self
                .resolver
                .resolve_stream_url(&job.track.stream_ref, self.quality)
                .await;

            let step = self.complete(job, result);
            if let Step::Backoff(delay) = step {
                if !self.pause(delay).await {
                    break;
                }
            }
            if !self.pause(self.inter_job_delay).await {
                break;
            }
        }

        self.finish();
    }

    /// Comprueba si queda trabajo y limpia el flag de procesamiento bajo el
    /// mismo lock, así un enqueue que coincide con el fin del loop arranca uno
    /// nuevo.
    fn has_work(&self) -> bool {
        let mut state = self.state.lock();
        if !state.pending.is_empty() && state.resolved_this_batch < self.max_preload_count {
            return true;
        }
        state.processing = false;
        self.idle.send_replace(true);
        false
    }

    /// Solo se alcanza en el shutdown, cuando ya no puede arrancar otro loop.
    fn finish(&self) {
        self.state.lock().processing = false;
        self.idle.send_replace(true);
        debug!("⏹️ Loop de precarga cancelado");
    }

    fn take_next(&self) -> Option<PreloadJob> {
        let mut state = self.state.lock();
        let job = state.pending.pop_front()?;
        state.in_flight = Some(job.source_key.clone());
        Some(job)
    }

    fn complete(&self, job: PreloadJob, result: Result<String>) -> Step {
        let mut state = self.state.lock();
        state.in_flight = None;
        let current = job.generation == state.generation;

        match result {
            Ok(url) => {
                self.cache.cache_streaming_url(&job.source_key, url);
                if current {
                    state.resolved_this_batch += 1;
                }
                info!(
                    "✅ Precargado {} ({}/{})",
                    job.source_key, state.resolved_this_batch, self.max_preload_count
                );
                self.events.emit(ResolverEvent::PreloadResolved {
                    source_key: job.source_key,
                });
                Step::Next
            }
            Err(e) => match RetryPolicy::classify(&e, self.rate_limit_backoff) {
                RetryPolicy::InfiniteBackoff { delay } => {
                    warn!(
                        "🚦 Precarga de {} limitada, reintentando en {:?}: {}",
                        job.source_key, delay, e
                    );
                    self.events.emit(ResolverEvent::RateLimited {
                        source_key: job.source_key.clone(),
                        backoff: delay,
                    });
                    if current {
                        state.pending.push_front(job);
                    }
                    Step::Backoff(delay)
                }
                RetryPolicy::NoRetry => {
                    warn!("🗑️ Descartando precarga de {}: {}", job.source_key, e);
                    self.events.emit(ResolverEvent::PreloadDropped {
                        source_key: job.source_key,
                        error: e.to_string(),
                    });
                    Step::Next
                }
            },
        }
    }

    /// Duerme salvo que el proceso se esté cerrando; `false` en el shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
