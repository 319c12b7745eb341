use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Granularidad del timer. Un hueco se libera estrictamente después de
/// `window_duration`, así la espera reportada pasa un tick del borde de la
/// ventana.
const TICK: Duration = Duration::from_millis(1);

/// Presupuesto de peticiones del scheduler de precarga.
///
/// Guarda el momento de cada petición aún dentro de la ventana, así el límite
/// se cumple en cualquier `window_duration` deslizante y no solo en bloques
/// fijos.
#[derive(Debug)]
pub struct RateLimitWindow {
    max_requests_per_window: usize,
    window_duration: Duration,
    issued: VecDeque<Instant>,
}

impl RateLimitWindow {
    pub fn new(max_requests_per_window: usize, window_duration: Duration) -> Self {
        Self {
            max_requests_per_window: max_requests_per_window.max(1),
            window_duration,
            issued: VecDeque::with_capacity(max_requests_per_window),
        }
    }

    pub fn max_requests_per_window(&self) -> usize {
        self.max_requests_per_window
    }

    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    /// Peticiones emitidas dentro de la ventana actual.
    pub fn request_count(&mut self) -> usize {
        self.prune(Instant::now());
        self.issued.len()
    }

    /// Momento de la petición más antigua que aún cuenta.
    pub fn window_start(&mut self) -> Option<Instant> {
        self.prune(Instant::now());
        self.issued.front().copied()
    }

    /// `None` si se puede emitir una petición ahora; si no, cuánto esperar.
    pub fn time_until_available(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.prune(now);
        if self.issued.len() < self.max_requests_per_window {
            return None;
        }
        self.issued
            .front()
            .map(|oldest| (*oldest + self.window_duration + TICK).saturating_duration_since(now))
    }

    pub fn record(&mut self) {
        self.issued.push_back(Instant::now());
    }

    /// Registra una petición si el presupuesto lo permite.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        match self.time_until_available() {
            None => {
                self.record();
                Ok(())
            }
            Some(wait) => Err(wait),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.issued.front() {
            if *oldest + self.window_duration < now {
                self.issued.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausts_and_reports_wait() {
        let mut window = RateLimitWindow::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(window.try_acquire().is_ok());
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        assert_eq!(window.request_count(), 3);
        // La petición más antigua fue hace 30s.
        assert_eq!(
            window.try_acquire(),
            Err(Duration::from_secs(30) + Duration::from_millis(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_free_up_one_by_one() {
        let mut window = RateLimitWindow::new(2, Duration::from_secs(60));
        window.record();
        tokio::time::advance(Duration::from_secs(20)).await;
        window.record();

        tokio::time::advance(Duration::from_secs(40)).await;
        // Justo una ventana después la primera petición aún cuenta.
        assert_eq!(window.request_count(), 2);
        assert_eq!(window.time_until_available(), Some(Duration::from_millis(1)));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(window.time_until_available(), None);
        assert_eq!(window.request_count(), 1);

        window.record();
        assert_eq!(
            window.time_until_available(),
            Some(Duration::from_secs(20))
        );
    }
}
