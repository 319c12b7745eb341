use std::time::Duration;

use crate::error::ResolveError;

/// Qué hace el scheduler con un job cuya resolución falló.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Esperar `delay` y devolver el job a la cabeza de la cola. Sin límite de
    /// intentos.
    InfiniteBackoff { delay: Duration },
    /// Registrar en el log y olvidar el job.
    NoRetry,
}

impl RetryPolicy {
    /// El throttling siempre se considera recuperable; cualquier otro error se
    /// asume como una referencia de track inválida.
    pub fn classify(error: &ResolveError, backoff: Duration) -> Self {
        if error.is_rate_limit() {
            RetryPolicy::InfiniteBackoff { delay: backoff }
        } else {
            RetryPolicy::NoRetry
        }
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            RetryPolicy::InfiniteBackoff { delay } => Some(*delay),
            RetryPolicy::NoRetry => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKOFF: Duration = Duration::from_secs(30);

    #[test]
    fn test_rate_limit_errors_back_off() {
        let err = ResolveError::Status {
            endpoint: "https://a.example".into(),
            status: 429,
        };
        assert_eq!(
            RetryPolicy::classify(&err, BACKOFF),
            RetryPolicy::InfiniteBackoff { delay: BACKOFF }
        );

        let wrapped = ResolveError::Unavailable {
            track: "1".into(),
            last: Box::new(ResolveError::Network {
                endpoint: "backup".into(),
                message: "rate limit exceeded".into(),
            }),
        };
        assert_eq!(RetryPolicy::classify(&wrapped, BACKOFF).retry_delay(), Some(BACKOFF));
    }

    #[test]
    fn test_other_errors_are_dropped() {
        let err = ResolveError::Unavailable {
            track: "1".into(),
            last: Box::new(ResolveError::Status {
                endpoint: "backup".into(),
                status: 404,
            }),
        };
        assert_eq!(RetryPolicy::classify(&err, BACKOFF), RetryPolicy::NoRetry);
        assert_eq!(RetryPolicy::NoRetry.retry_delay(), None);
    }
}
