use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use dial_proto::config::{BasePolicy, Config};
use dial_proto::model::{Rgb, Track};
use dial_proto::registry::StationRegistry;
use dial_proto::state::{PersistentState, StateStore};

use crate::backend::PlaybackBackend;
use crate::crossfade::CrossfadeEngine;
use crate::dial::{self, DialState};
use crate::indicator::{Indicator, IndicatorSink, Palette};
use crate::input::{ControlSource, LatchedInput};
use crate::overlay::{OverlayMachine, OverlayPhase, OverlaySettings};
use crate::watchdog::Watchdog;

// ── events ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreEvent {
    /// Cut the running overlay event short (SIGUSR1).
    SkipOverlay,
    /// Start an overlay event on the next tick (SIGUSR2).
    TriggerOverlay,
    /// Shutdown requested.
    Shutdown,
}

/// What one tick produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSnapshot {
    pub dial: DialState,
    pub master: f32,
    pub phase: OverlayPhase,
    pub color: Rgb,
}

/// `(raw/100)^curve`, clamped to 0..=1.
pub fn shape_volume(raw: f32, curve: f32) -> f32 {
    (raw / 100.0).clamp(0.0, 1.0).powf(curve)
}

// ── DialCore ──────────────────────────────────────────────────────────────────

/// The control loop.  One task owns every piece of mutable state; each tick
/// reads the controls, writes base and overlay volumes, restarts dead
/// channels and updates the indicator, in that order.
pub struct DialCore<B, S> {
    registry: StationRegistry,
    backend: B,
    crossfade: CrossfadeEngine,
    overlay: OverlayMachine,
    dial_input: LatchedInput<S>,
    volume_input: LatchedInput<S>,
    palette: Palette,
    indicator: Indicator,
    base_policy: BasePolicy,
    volume_curve: f32,
    tick_period: std::time::Duration,
    watchdog: Watchdog,
    state: StateStore,
    /// Pair at the last state save.
    saved_pair: Option<(usize, usize)>,
    /// Most recent background save; each one waits for its predecessor.
    pending_save: Option<JoinHandle<()>>,
}

impl<B: PlaybackBackend, S: ControlSource> DialCore<B, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        registry: StationRegistry,
        backend: B,
        dial_input: LatchedInput<S>,
        volume_input: LatchedInput<S>,
        indicator: Indicator,
        started: Instant,
    ) -> Self {
        let media_dir = &config.playback.media_dir;
        let effects = config
            .overlay
            .effects
            .iter()
            .map(|m| m.resolve(media_dir))
            .collect();
        let blends = config
            .overlay
            .blends
            .iter()
            .map(|t| Track {
                media: t.media.resolve(media_dir),
                class: t.class,
            })
            .collect();
        let settings =
            OverlaySettings::from_config(&config.overlay, config.playback.acquire_timeout());

        Self {
            registry,
            backend,
            crossfade: CrossfadeEngine::new(
                config.playback.load_mode,
                config.playback.acquire_timeout(),
            ),
            overlay: OverlayMachine::new(settings, effects, blends, started),
            dial_input,
            volume_input,
            palette: Palette::from_config(&config.indicator),
            indicator,
            base_policy: config.overlay.base_policy,
            volume_curve: config.control.volume_curve,
            tick_period: config.control.tick_period(),
            watchdog: Watchdog::new(
                config.playback.watchdog_backoff(),
                config.playback.acquire_timeout(),
            ),
            state: StateStore::new(config.daemon.state_file.clone()),
            saved_pair: None,
            pending_save: None,
        }
    }

    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!(
            "core: starting, {} stations, tick {:?}",
            self.registry.len(),
            self.tick_period
        );
        self.crossfade
            .preload(&mut self.backend, &self.registry)
            .await;

        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                now = ticker.tick() => {
                    self.tick(now).await;
                }
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("core: event channel closed, shutting down");
                        break;
                    }
                    Some(CoreEvent::Shutdown) => {
                        info!("core: shutdown requested");
                        break;
                    }
                    Some(CoreEvent::SkipOverlay) => {
                        if !self.overlay.skip() {
                            debug!("core: nothing to skip");
                        }
                    }
                    Some(CoreEvent::TriggerOverlay) => {
                        if self.overlay.request_trigger() {
                            info!("core: overlay trigger requested");
                        }
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One control step at `now`.
    pub async fn tick(&mut self, now: Instant) -> TickSnapshot {
        let raw_dial = self.dial_input.read().await;
        let raw_volume = self.volume_input.read().await;
        let master = shape_volume(raw_volume, self.volume_curve);
        let dial = dial::map(raw_dial, self.registry.len());

        let base_gain = match self.base_policy {
            BasePolicy::Mute if self.overlay.is_active() => 0.0,
            _ => master,
        };
        self.crossfade
            .apply(&mut self.backend, &self.registry, &dial, base_gain)
            .await;

        let phase = self.overlay.advance(&mut self.backend, now, master).await;

        let mut handles = self.crossfade.handles();
        handles.extend(self.overlay.handles());
        self.watchdog.check(&mut self.backend, &handles, now).await;

        let class_of = |i: usize| {
            self.registry
                .get(i)
                .map(|s| s.class)
                .unwrap_or_default()
        };
        let color = self.palette.color(
            class_of(dial.floor),
            class_of(dial.ceil),
            dial.t,
            self.overlay.is_active(),
        );
        self.indicator.show(color);

        if self.saved_pair != Some(dial.pair()) {
            self.saved_pair = Some(dial.pair());
            self.save_in_background();
        }

        TickSnapshot {
            dial,
            master,
            phase,
            color,
        }
    }

    fn snapshot_state(&self) -> PersistentState {
        PersistentState {
            dial: self.dial_input.last_good(),
            volume: self.volume_input.last_good(),
        }
    }

    fn save_in_background(&mut self) {
        let state = self.snapshot_state();
        let store = self.state.clone();
        let previous = self.pending_save.take();
        self.pending_save = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = store.save(&state).await {
                warn!("core: could not save state to {:?}: {}", store.path(), e);
            }
        }));
    }

    /// Release every channel, save the controls and blank the indicator.
    /// Returns the backend for inspection.
    pub async fn shutdown(mut self) -> B {
        self.overlay.abort(&mut self.backend).await;
        self.crossfade.release_all(&mut self.backend).await;
        self.backend.shutdown().await;

        if let Some(pending) = self.pending_save.take() {
            let _ = pending.await;
        }
        let state = self.snapshot_state();
        if let Err(e) = self.state.save(&state).await {
            warn!("core: could not save state to {:?}: {}", self.state.path(), e);
        }

        let DialCore {
            backend,
            mut indicator,
            ..
        } = self;
        indicator.clear();
        indicator.close().await;
        info!("core: stopped");
        backend
    }
}
