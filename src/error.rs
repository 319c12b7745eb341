//! Error types for the resolver pipeline.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Detecta mensajes del upstream que indican throttling aunque un proxy se haya
/// tragado el status code.
static RATE_LIMIT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(rate[ _-]?limit|too many requests|\b429\b)")
        .expect("rate limit marker regex is valid")
});

/// Alias de Result para la resolución contra el upstream.
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Errores al resolver búsquedas o URLs de stream contra el upstream.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// El intento superó su timeout por petición
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },

    /// Respuesta no 2xx
    #[error("{endpoint} answered HTTP {status}")]
    Status { endpoint: String, status: u16 },

    /// HTTP 429 o un body que indica throttling
    #[error("{endpoint} is rate limiting requests")]
    RateLimited { endpoint: String },

    /// Conexión rechazada, DNS, TLS, body roto...
    #[error("network error on {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    /// El body es JSON válido pero no coincide con ningún formato conocido
    #[error("unrecognized response shape from {endpoint}: {detail}")]
    UnrecognizedShape { endpoint: String, detail: String },

    #[error("invalid endpoint url '{0}'")]
    InvalidEndpoint(String),

    #[error("no endpoints configured")]
    NoEndpoints,

    /// Todos los endpoints de un set fallaron en una misma resolución
    #[error("all {attempts} endpoints failed, last error: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<ResolveError>,
    },

    /// Fallaron los endpoints de stream principales y el de respaldo
    #[error("track {track} is unavailable: {last}")]
    Unavailable {
        track: String,
        last: Box<ResolveError>,
    },
}

impl ResolveError {
    /// Indica si el fallo pertenece a la clase rate limit.
    ///
    /// Los errores envueltos se clasifican por su última causa, así un set de
    /// endpoints agotado cuyo último intento fue limitado sigue contando como
    /// rate limit.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            ResolveError::RateLimited { .. } => true,
            ResolveError::Status { status: 429, .. } => true,
            ResolveError::Exhausted { last, .. } | ResolveError::Unavailable { last, .. } => {
                last.is_rate_limit()
            }
            ResolveError::Network { message, .. } => RATE_LIMIT_MARKER.is_match(message),
            ResolveError::UnrecognizedShape { detail, .. } => RATE_LIMIT_MARKER.is_match(detail),
            _ => false,
        }
    }

    /// Indica si el error viene de la resolución de stream y no de la búsqueda.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ResolveError::Unavailable { .. })
    }

    /// Texto seguro para mostrar al usuario; nunca incluye detalles del
    /// upstream.
    pub fn user_message(&self) -> &'static str {
        match self {
            ResolveError::Unavailable { .. } => "Playback unavailable",
            _ if self.is_rate_limit() => "Service busy, please try again shortly",
            _ => "No results",
        }
    }
}

/// Errores del almacén clave-valor durable.
#[derive(Error, Debug)]
pub enum StoreError {
    /// La escritura superaría la capacidad del almacén
    #[error("storage quota exceeded while writing '{key}'")]
    Full { key: String },

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_full(&self) -> bool {
        matches!(self, StoreError::Full { .. })
    }
}

/// Errores del caché persistente de API.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
