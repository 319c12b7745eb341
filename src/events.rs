//! Structured pipeline events.
//!
//! The core never formats user-facing notices itself; it emits
//! [`ResolverEvent`]s that a UI layer or logger consumes from its own
//! subscription.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Algo relevante ocurrió dentro del pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverEvent {
    /// Un mirror falló y la rotación avanzó
    EndpointFailed {
        endpoint: String,
        attempt: usize,
        error: String,
    },
    /// La resolución de stream recurrió al endpoint de respaldo
    BackupEndpointUsed { track_id: String },
    SearchResolved {
        query: String,
        results: usize,
        from_cache: bool,
    },
    StreamResolved {
        source_key: String,
        from_cache: bool,
    },
    /// El scheduler espera a que se libere la ventana de peticiones
    RateLimitWait { wait: Duration },
    /// El upstream limitó una precarga; se reintenta tras `backoff`
    RateLimited {
        source_key: String,
        backoff: Duration,
    },
    PreloadQueued { source_key: String, priority: u32 },
    PreloadDeferred { source_key: String, priority: u32 },
    PreloadResolved { source_key: String },
    PreloadDropped { source_key: String, error: String },
    PreloadReset { discarded: usize },
}

/// Reparte los [`ResolverEvent`] a cada suscriptor vivo.
///
/// Cada suscriptor tiene su propio canal `flume` acotado. Emitir nunca bloquea:
/// el evento se descarta para un suscriptor con el buffer lleno, y sin
/// suscriptores no se guarda nada. Los suscriptores desconectados se eliminan
/// en el siguiente emit.
#[derive(Debug, Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<flume::Sender<ResolverEvent>>>>,
    capacity: usize,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn emit(&self, event: ResolverEvent) {
        self.subscribers.lock().retain(|sender| {
            match sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(dropped)) => {
                    trace!("Evento descartado, suscriptor atrasado: {:?}", dropped);
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Receiver nuevo que recibe cada evento emitido desde ahora.
    pub fn subscribe(&self) -> flume::Receiver<ResolverEvent> {
        let (sender, receiver) = flume::bounded(self.capacity);
        self.subscribers.lock().push(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
