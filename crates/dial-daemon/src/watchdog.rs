use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{restart_within, HandleId, PlaybackBackend};

/// Restarts channels that stopped on their own, at most once per `backoff`
/// per handle so a file that dies instantly cannot spin the loop.  Each
/// restart gets `limit` before the tick moves on.
pub struct Watchdog {
    backoff: Duration,
    limit: Duration,
    last_restart: HashMap<HandleId, Instant>,
}

impl Watchdog {
    pub fn new(backoff: Duration, limit: Duration) -> Self {
        Self {
            backoff,
            limit,
            last_restart: HashMap::new(),
        }
    }

    /// Check `handles`, restart the dead ones.  Returns how many restarts
    /// finished within the limit; an attempt that ran out of time still
    /// counts against the backoff.
    pub async fn check<B: PlaybackBackend>(
        &mut self,
        backend: &mut B,
        handles: &[HandleId],
        now: Instant,
    ) -> usize {
        self.last_restart.retain(|h, _| handles.contains(h));

        let mut restarted = 0;
        for &h in handles {
            if backend.is_alive(h) {
                continue;
            }
            if let Some(&at) = self.last_restart.get(&h) {
                if now.saturating_duration_since(at) < self.backoff {
                    debug!("watchdog: {} still down, backing off", h);
                    continue;
                }
            }
            warn!("watchdog: {} stopped, restarting", h);
            let finished = restart_within(backend, h, self.limit).await;
            self.last_restart.insert(h, now);
            if finished {
                restarted += 1;
            }
        }
        restarted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingBackend;
    use dial_proto::model::MediaRef;

    #[tokio::test]
    async fn test_restart_is_rate_limited() {
        let mut backend = RecordingBackend::new();
        let h = backend.acquire(&MediaRef::from("ch1.ogg")).await;
        let mut dog = Watchdog::new(Duration::from_secs(2), Duration::from_secs(1));
        let t0 = Instant::now();

        assert_eq!(dog.check(&mut backend, &[h], t0).await, 0);

        backend.kill(h);
        assert_eq!(dog.check(&mut backend, &[h], t0).await, 1);
        assert_eq!(backend.channel(h).restarts, 1);

        backend.kill(h);
        let soon = t0 + Duration::from_millis(500);
        assert_eq!(dog.check(&mut backend, &[h], soon).await, 0);

        let later = t0 + Duration::from_secs(2);
        assert_eq!(dog.check(&mut backend, &[h], later).await, 1);
        assert_eq!(backend.channel(h).restarts, 2);
    }

    #[tokio::test]
    async fn test_forgets_released_handles() {
        let mut backend = RecordingBackend::new();
        let h = backend.acquire(&MediaRef::from("ch1.ogg")).await;
        let mut dog = Watchdog::new(Duration::from_secs(2), Duration::from_secs(1));
        backend.kill(h);
        dog.check(&mut backend, &[h], Instant::now()).await;
        dog.check(&mut backend, &[], Instant::now()).await;
        assert!(dog.last_restart.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_restart_does_not_stall_the_check() {
        let mut backend = RecordingBackend::new();
        let slow = backend.acquire(&MediaRef::from("ch1.ogg")).await;
        let other = backend.acquire(&MediaRef::from("ch2.ogg")).await;
        let mut dog = Watchdog::new(Duration::from_secs(2), Duration::from_millis(500));
        backend.kill(slow);
        backend.restart_delay = Some(Duration::from_secs(30));

        let t0 = Instant::now();
        assert_eq!(dog.check(&mut backend, &[slow, other], t0).await, 0);
        assert!(t0.elapsed() < Duration::from_secs(1));
        assert!(!backend.is_alive(slow));

        backend.restart_delay = None;
        let retry = t0 + Duration::from_millis(100);
        assert_eq!(dog.check(&mut backend, &[slow, other], retry).await, 0);

        let later = t0 + Duration::from_secs(2);
        assert_eq!(dog.check(&mut backend, &[slow, other], later).await, 1);
        assert!(backend.is_alive(slow));
    }
}
