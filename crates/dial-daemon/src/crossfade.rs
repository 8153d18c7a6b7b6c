use std::collections::BTreeMap;
use std::time::Duration;

use dial_proto::config::LoadMode;
use dial_proto::registry::StationRegistry;
use tracing::{debug, info};

use crate::backend::{acquire_within, HandleId, PlaybackBackend};
use crate::dial::DialState;

/// Blends the two stations adjacent to the dial.
///
/// Owns the station → handle map.  Only the current `(floor, ceil)` pair is
/// ever written a non-zero volume; a pair change silences the stations that
/// left it (and releases them in lazy mode) before the new pair is loaded.
pub struct CrossfadeEngine {
    mode: LoadMode,
    acquire_timeout: Duration,
    handles: BTreeMap<usize, HandleId>,
    active: Option<(usize, usize)>,
    /// A station of the active pair could not be acquired yet.
    pending: bool,
}

impl CrossfadeEngine {
    pub fn new(mode: LoadMode, acquire_timeout: Duration) -> Self {
        Self {
            mode,
            acquire_timeout,
            handles: BTreeMap::new(),
            active: None,
            pending: false,
        }
    }

    /// Eager mode: load every station muted.  No-op in lazy mode.  Stations
    /// that time out here are picked up on demand by `apply`.
    pub async fn preload<B: PlaybackBackend>(
        &mut self,
        backend: &mut B,
        registry: &StationRegistry,
    ) {
        if self.mode != LoadMode::Eager {
            return;
        }
        for station in registry.stations() {
            if self.handles.contains_key(&station.index) {
                continue;
            }
            if let Some(h) = acquire_within(backend, &station.media, self.acquire_timeout).await {
                debug!("crossfade: preloaded {:02} {} as {}", station.index, station.name, h);
                self.handles.insert(station.index, h);
            }
        }
        info!(
            "crossfade: preloaded {}/{} stations",
            self.handles.len(),
            registry.len()
        );
    }

    /// Write this tick's base volumes.  `gain` is master volume (already
    /// shaped, and zero while a muting overlay runs).
    pub async fn apply<B: PlaybackBackend>(
        &mut self,
        backend: &mut B,
        registry: &StationRegistry,
        dial: &DialState,
        gain: f32,
    ) {
        let pair = dial.pair();
        if self.active != Some(pair) {
            self.switch_pair(backend, pair).await;
        }
        if self.pending {
            self.load_pair(backend, registry, pair).await;
        }

        let gain = gain.clamp(0.0, 1.0);
        let (w_floor, w_ceil) = dial.weights();
        if let Some(&h) = self.handles.get(&dial.floor) {
            backend.set_volume(h, w_floor * gain);
        }
        if dial.ceil != dial.floor {
            if let Some(&h) = self.handles.get(&dial.ceil) {
                backend.set_volume(h, w_ceil * gain);
            }
        }
    }

    async fn switch_pair<B: PlaybackBackend>(&mut self, backend: &mut B, pair: (usize, usize)) {
        if let Some((old_floor, old_ceil)) = self.active {
            let mut leaving = vec![old_floor];
            if old_ceil != old_floor {
                leaving.push(old_ceil);
            }
            for idx in leaving {
                if idx == pair.0 || idx == pair.1 {
                    continue;
                }
                let Some(&h) = self.handles.get(&idx) else {
                    continue;
                };
                backend.set_volume(h, 0.0);
                if self.mode == LoadMode::Lazy {
                    backend.release(h).await;
                    self.handles.remove(&idx);
                }
            }
        }
        debug!("crossfade: active pair {:?} -> {:?}", self.active, pair);
        self.active = Some(pair);
        self.pending = true;
    }

    async fn load_pair<B: PlaybackBackend>(
        &mut self,
        backend: &mut B,
        registry: &StationRegistry,
        pair: (usize, usize),
    ) {
        let mut missing = false;
        for idx in [pair.0, pair.1] {
            if self.handles.contains_key(&idx) {
                continue;
            }
            let Some(station) = registry.get(idx) else {
                continue;
            };
            match acquire_within(backend, &station.media, self.acquire_timeout).await {
                Some(h) => {
                    info!("crossfade: loaded {:02} {} as {}", idx, station.name, h);
                    self.handles.insert(idx, h);
                }
                None => missing = true,
            }
        }
        self.pending = missing;
    }

    pub fn active_pair(&self) -> Option<(usize, usize)> {
        self.active
    }

    pub fn handle_for(&self, station: usize) -> Option<HandleId> {
        self.handles.get(&station).copied()
    }

    /// Every base handle currently held, for the watchdog.
    pub fn handles(&self) -> Vec<HandleId> {
        self.handles.values().copied().collect()
    }

    pub async fn release_all<B: PlaybackBackend>(&mut self, backend: &mut B) {
        for (_, h) in std::mem::take(&mut self.handles) {
            backend.set_volume(h, 0.0);
            backend.release(h).await;
        }
        self.active = None;
        self.pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::RecordingBackend;
    use crate::dial;
    use dial_proto::model::{Classification, MediaRef, Station};

    fn registry(n: usize) -> StationRegistry {
        StationRegistry::new(
            (0..n)
                .map(|i| Station {
                    index: i,
                    name: format!("st{i}"),
                    media: MediaRef::new(format!("st{i}.ogg")),
                    class: Classification::Signal,
                })
                .collect(),
        )
        .unwrap()
    }

    fn engine(mode: LoadMode) -> CrossfadeEngine {
        CrossfadeEngine::new(mode, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_midpoint_splits_master_volume() {
        let reg = registry(16);
        let mut backend = RecordingBackend::new();
        let mut xf = engine(LoadMode::Lazy);

        xf.apply(&mut backend, &reg, &dial::map(50.0, 16), 0.8).await;

        assert_eq!(backend.channels.len(), 2);
        assert!((backend.volume_of("st7.ogg").unwrap() - 0.4).abs() < 1e-6);
        assert!((backend.volume_of("st8.ogg").unwrap() - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_bottom_edge_full_volume_on_first_station() {
        let reg = registry(16);
        let mut backend = RecordingBackend::new();
        let mut xf = engine(LoadMode::Eager);
        xf.preload(&mut backend, &reg).await;
        assert_eq!(backend.channels.len(), 16);

        xf.apply(&mut backend, &reg, &dial::map(0.0, 16), 0.7).await;

        assert!((backend.volume_of("st0.ogg").unwrap() - 0.7).abs() < 1e-6);
        assert!((backend.total_volume() - 0.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_top_edge_has_no_double_volume() {
        let reg = registry(16);
        let mut backend = RecordingBackend::new();
        let mut xf = engine(LoadMode::Lazy);

        xf.apply(&mut backend, &reg, &dial::map(100.0, 16), 1.0).await;

        assert_eq!(backend.channels.len(), 1);
        assert_eq!(backend.volume_of("st15.ogg"), Some(1.0));
    }

    #[tokio::test]
    async fn test_lazy_pair_change_releases_leaving_stations() {
        let reg = registry(4);
        let mut backend = RecordingBackend::new();
        let mut xf = engine(LoadMode::Lazy);

        // pair (0, 1)
        xf.apply(&mut backend, &reg, &dial::map(10.0, 4), 1.0).await;
        let first = xf.handle_for(0).unwrap();
        let shared = xf.handle_for(1).unwrap();

        // pair (1, 2): station 0 leaves, station 1 keeps its handle
        xf.apply(&mut backend, &reg, &dial::map(50.0, 4), 1.0).await;
        assert_eq!(backend.released, vec![first]);
        assert_eq!(xf.handle_for(1), Some(shared));
        assert_eq!(xf.active_pair(), Some((1, 2)));
        assert_eq!(backend.channels.len(), 2);

        // unchanged pair: no reloads
        let acquired = backend.acquired.len();
        xf.apply(&mut backend, &reg, &dial::map(55.0, 4), 1.0).await;
        assert_eq!(backend.acquired.len(), acquired);
    }

    #[tokio::test]
    async fn test_eager_pair_change_silences_but_keeps_handles() {
        let reg = registry(4);
        let mut backend = RecordingBackend::new();
        let mut xf = engine(LoadMode::Eager);
        xf.preload(&mut backend, &reg).await;

        xf.apply(&mut backend, &reg, &dial::map(10.0, 4), 1.0).await;
        xf.apply(&mut backend, &reg, &dial::map(90.0, 4), 1.0).await;

        assert!(backend.released.is_empty());
        assert_eq!(backend.volume_of("st0.ogg"), Some(0.0));
        assert_eq!(backend.volume_of("st1.ogg"), Some(0.0));
        assert!((backend.total_volume() - 1.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_acquire_is_retried_next_tick() {
        let reg = registry(3);
        let mut backend = RecordingBackend::new();
        backend.acquire_delay = Some(Duration::from_secs(5));
        let mut xf = engine(LoadMode::Lazy);

        xf.apply(&mut backend, &reg, &dial::map(25.0, 3), 1.0).await;
        assert!(backend.channels.is_empty());

        backend.acquire_delay = None;
        xf.apply(&mut backend, &reg, &dial::map(25.0, 3), 1.0).await;
        assert_eq!(backend.channels.len(), 2);
        assert!((backend.volume_of("st0.ogg").unwrap() - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_release_all() {
        let reg = registry(3);
        let mut backend = RecordingBackend::new();
        let mut xf = engine(LoadMode::Eager);
        xf.preload(&mut backend, &reg).await;
        xf.release_all(&mut backend).await;
        assert!(backend.channels.is_empty());
        assert_eq!(backend.released.len(), 3);
        assert!(xf.handles().is_empty());
    }
}
