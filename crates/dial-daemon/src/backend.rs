//! Playback backend seam.
//!
//! A backend turns media references into looping channels and exposes a
//! per-channel volume.  The scheduler is generic over [`PlaybackBackend`], so
//! the external-process backend (`mpv`) and the in-process sample mixer
//! (`mixer`) run the same control loop.
//!
//! Contract shared by every implementation:
//!   - `acquire` never fails: unreadable media is replaced by the fallback
//!     track and a warning is logged.  The returned channel loops at volume 0.
//!   - `set_volume`, `volume` and `is_alive` never block on I/O.
//!   - liveness changes detected on backend threads are published through
//!     atomics and only acted on when the scheduler calls `restart`.
use std::fmt;
use std::time::Duration;

use dial_proto::model::MediaRef;
use tracing::warn;

/// Opaque reference to one backend channel.  Only the backend that issued it
/// can interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub(crate) u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[allow(async_fn_in_trait)]
pub trait PlaybackBackend {
    /// Load `media`, start it looping at volume 0 and return its handle.
    async fn acquire(&mut self, media: &MediaRef) -> HandleId;

    /// Set the channel volume, `0.0..=1.0`.  Unknown handles are ignored.
    fn set_volume(&mut self, handle: HandleId, volume: f32);

    /// Last volume written to the channel (0.0 for unknown handles).
    fn volume(&self, handle: HandleId) -> f32;

    /// False once the channel stopped on its own (process died, track ended
    /// without being requeued, output device lost).
    fn is_alive(&mut self, handle: HandleId) -> bool;

    /// Reload the channel's media in place, keeping its handle and volume.
    async fn restart(&mut self, handle: HandleId);

    /// Stop the channel and free its resources.
    async fn release(&mut self, handle: HandleId);

    /// Stop everything.  Called once on the way out.
    async fn shutdown(&mut self);
}

/// `acquire` bounded by `limit`.  Returns `None` when the backend did not
/// answer in time; the caller retries on a later tick.
pub async fn acquire_within<B: PlaybackBackend>(
    backend: &mut B,
    media: &MediaRef,
    limit: Duration,
) -> Option<HandleId> {
    match tokio::time::timeout(limit, backend.acquire(media)).await {
        Ok(handle) => Some(handle),
        Err(_) => {
            warn!(
                "backend: acquire of {} did not finish within {:?}",
                media.label(),
                limit
            );
            None
        }
    }
}

/// `restart` bounded by `limit`.  Returns `false` when the backend did not
/// finish in time; the channel then still reads as dead and is retried.
pub async fn restart_within<B: PlaybackBackend>(
    backend: &mut B,
    handle: HandleId,
    limit: Duration,
) -> bool {
    match tokio::time::timeout(limit, backend.restart(handle)).await {
        Ok(()) => true,
        Err(_) => {
            warn!("backend: restart of {} did not finish within {:?}", handle, limit);
            false
        }
    }
}

/// Pick what to actually load: `media` when readable, otherwise `fallback`.
pub fn resolve_media(media: &MediaRef, fallback: &MediaRef) -> MediaRef {
    if media.is_readable() {
        media.clone()
    } else {
        warn!(
            "backend: {} is unreadable, substituting {}",
            media,
            fallback.label()
        );
        fallback.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingBackend;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_times_out() {
        let mut backend = RecordingBackend::new();
        backend.acquire_delay = Some(Duration::from_secs(10));
        let media = MediaRef::from("slow.ogg");
        assert!(acquire_within(&mut backend, &media, Duration::from_secs(1))
            .await
            .is_none());
        assert!(backend.channels.is_empty());

        backend.acquire_delay = None;
        let handle = acquire_within(&mut backend, &media, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(backend.volume(handle), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_within_times_out() {
        let mut backend = RecordingBackend::new();
        let handle = backend.acquire(&MediaRef::from("ch1.ogg")).await;
        backend.kill(handle);
        backend.restart_delay = Some(Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        assert!(!restart_within(&mut backend, handle, Duration::from_secs(1)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!backend.is_alive(handle));

        backend.restart_delay = None;
        assert!(restart_within(&mut backend, handle, Duration::from_secs(1)).await);
        assert!(backend.is_alive(handle));
    }

    #[test]
    fn test_resolve_media_substitutes_unreadable_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let good = dir.path().join("good.wav");
        std::fs::write(&good, b"RIFF").unwrap();
        let good = MediaRef::from(good);
        let missing = MediaRef::from(dir.path().join("missing.wav"));

        assert_eq!(resolve_media(&good, &missing), good);
        assert_eq!(resolve_media(&missing, &good), good);

        let uri = MediaRef::from("http://example.invalid/live.mp3");
        assert_eq!(resolve_media(&uri, &good), uri);
    }
}
