/// Overlay events: a random effect track plus a random blend track layered on
/// top of the base mix.
///
/// ```text
///   Idle ──interval elapsed / manual trigger──▶ FadingIn
///   FadingIn ──envelope = 1──▶ Holding
///   Holding ──hold elapsed──▶ FadingOut        (skip: FadingIn|Holding ▶ FadingOut)
///   FadingOut ──envelope = 0, both channels silent──▶ Idle
/// ```
///
/// The machine is advanced once per scheduler tick and never waits on the
/// tracks themselves.  Overlay gain is `envelope × gain_ceiling × master`.
use std::time::Duration;

use dial_proto::config::OverlayConfig;
use dial_proto::model::{MediaRef, Track};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{acquire_within, HandleId, PlaybackBackend};

/// Envelope values this close to an end are snapped onto it.
const ENVELOPE_EPSILON: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayPhase {
    Idle,
    FadingIn,
    Holding,
    FadingOut,
}

#[derive(Debug, Clone)]
pub struct OverlaySettings {
    pub interval: Duration,
    pub hold: Duration,
    pub fade_step: f32,
    pub gain_ceiling: f32,
    pub acquire_timeout: Duration,
}

impl OverlaySettings {
    pub fn from_config(config: &OverlayConfig, acquire_timeout: Duration) -> Self {
        Self {
            interval: config.interval(),
            hold: config.hold(),
            fade_step: config.fade_step,
            gain_ceiling: config.gain_ceiling.clamp(0.0, 1.0),
            acquire_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    FadingIn,
    Holding { since: Instant },
    FadingOut,
}

/// The event in flight.
#[derive(Debug, Clone)]
pub struct OverlayEvent {
    pub effect: MediaRef,
    pub blend: Track,
    pub started: Instant,
    pub envelope: f32,
    effect_handle: HandleId,
    blend_handle: HandleId,
    stage: Stage,
}

pub struct OverlayMachine {
    settings: OverlaySettings,
    effects: Vec<MediaRef>,
    blends: Vec<Track>,
    event: Option<OverlayEvent>,
    last_trigger: Instant,
    trigger_requested: bool,
    rng: StdRng,
}

impl OverlayMachine {
    /// `started` seeds the interval timer: the first event fires one
    /// interval after it.
    pub fn new(
        settings: OverlaySettings,
        effects: Vec<MediaRef>,
        blends: Vec<Track>,
        started: Instant,
    ) -> Self {
        Self::with_rng(settings, effects, blends, started, StdRng::from_entropy())
    }

    pub fn with_rng(
        settings: OverlaySettings,
        effects: Vec<MediaRef>,
        blends: Vec<Track>,
        started: Instant,
        rng: StdRng,
    ) -> Self {
        Self {
            settings,
            effects,
            blends,
            event: None,
            last_trigger: started,
            trigger_requested: false,
            rng,
        }
    }

    pub fn phase(&self) -> OverlayPhase {
        match self.event.as_ref().map(|e| e.stage) {
            None => OverlayPhase::Idle,
            Some(Stage::FadingIn) => OverlayPhase::FadingIn,
            Some(Stage::Holding { .. }) => OverlayPhase::Holding,
            Some(Stage::FadingOut) => OverlayPhase::FadingOut,
        }
    }

    pub fn is_active(&self) -> bool {
        self.event.is_some()
    }

    pub fn event(&self) -> Option<&OverlayEvent> {
        self.event.as_ref()
    }

    pub fn envelope(&self) -> f32 {
        self.event.as_ref().map(|e| e.envelope).unwrap_or(0.0)
    }

    pub fn last_trigger(&self) -> Instant {
        self.last_trigger
    }

    /// Handles of the running event, for the watchdog.
    pub fn handles(&self) -> Vec<HandleId> {
        match &self.event {
            Some(e) => vec![e.effect_handle, e.blend_handle],
            None => Vec::new(),
        }
    }

    /// Ask for an event on the next tick.  Ignored while one is running.
    pub fn request_trigger(&mut self) -> bool {
        if self.event.is_some() {
            info!("overlay: trigger ignored, an event is already running");
            return false;
        }
        self.trigger_requested = true;
        true
    }

    /// Jump straight to the fade-out, keeping the current envelope.
    pub fn skip(&mut self) -> bool {
        match &mut self.event {
            Some(e) if e.stage != Stage::FadingOut => {
                info!("overlay: skipped at envelope {:.2}", e.envelope);
                e.stage = Stage::FadingOut;
                true
            }
            _ => false,
        }
    }

    /// Advance one tick.  Returns the phase after the step.
    pub async fn advance<B: PlaybackBackend>(
        &mut self,
        backend: &mut B,
        now: Instant,
        master: f32,
    ) -> OverlayPhase {
        if self.event.is_none() {
            let due = now.saturating_duration_since(self.last_trigger) >= self.settings.interval;
            if due || self.trigger_requested {
                self.trigger_requested = false;
                self.start(backend, now).await;
            }
            return self.phase();
        }

        let step = self.settings.fade_step;
        let hold = self.settings.hold;
        let gain_scale = self.settings.gain_ceiling * master.clamp(0.0, 1.0);

        let Some(event) = self.event.as_mut() else {
            return OverlayPhase::Idle;
        };

        if let Stage::Holding { since } = event.stage {
            if now.saturating_duration_since(since) >= hold {
                debug!("overlay: hold finished, fading out");
                event.stage = Stage::FadingOut;
            }
        }

        match event.stage {
            Stage::FadingIn => {
                event.envelope = step_up(event.envelope, step);
                if event.envelope >= 1.0 {
                    debug!("overlay: fully faded in, holding for {:?}", hold);
                    event.stage = Stage::Holding { since: now };
                }
            }
            Stage::Holding { .. } => event.envelope = 1.0,
            Stage::FadingOut => event.envelope = step_down(event.envelope, step),
        }

        let gain = event.envelope * gain_scale;
        backend.set_volume(event.effect_handle, gain);
        backend.set_volume(event.blend_handle, gain);

        let silent = backend.volume(event.effect_handle) <= 0.0
            && backend.volume(event.blend_handle) <= 0.0;
        if event.stage == Stage::FadingOut && event.envelope <= 0.0 && silent {
            let (effect, blend) = (event.effect_handle, event.blend_handle);
            info!(
                "overlay: {} + {} cleared after {:?}",
                event.effect.label(),
                event.blend.media.label(),
                now.saturating_duration_since(event.started)
            );
            backend.release(effect).await;
            backend.release(blend).await;
            self.event = None;
            self.last_trigger = now;
        }
        self.phase()
    }

    async fn start<B: PlaybackBackend>(&mut self, backend: &mut B, now: Instant) {
        let (Some(effect), Some(blend)) = (
            self.effects.choose(&mut self.rng).cloned(),
            self.blends.choose(&mut self.rng).cloned(),
        ) else {
            warn!("overlay: empty track pool, event skipped");
            self.last_trigger = now;
            return;
        };

        let limit = self.settings.acquire_timeout;
        let effect_handle = acquire_within(backend, &effect, limit).await;
        let blend_handle = acquire_within(backend, &blend.media, limit).await;
        let (effect_handle, blend_handle) = match (effect_handle, blend_handle) {
            (Some(e), Some(b)) => (e, b),
            (e, b) => {
                for h in [e, b].into_iter().flatten() {
                    backend.release(h).await;
                }
                warn!("overlay: could not load tracks, next attempt in {:?}", self.settings.interval);
                self.last_trigger = now;
                return;
            }
        };
        backend.set_volume(effect_handle, 0.0);
        backend.set_volume(blend_handle, 0.0);

        info!(
            "overlay: triggered {} + {}",
            effect.label(),
            blend.media.label()
        );
        self.event = Some(OverlayEvent {
            effect,
            blend,
            started: now,
            envelope: 0.0,
            effect_handle,
            blend_handle,
            stage: Stage::FadingIn,
        });
    }

    /// Drop the running event without a fade.  Shutdown path only.
    pub async fn abort<B: PlaybackBackend>(&mut self, backend: &mut B) {
        if let Some(event) = self.event.take() {
            for h in [event.effect_handle, event.blend_handle] {
                backend.set_volume(h, 0.0);
                backend.release(h).await;
            }
        }
    }
}

fn step_up(envelope: f32, step: f32) -> f32 {
    let next = envelope + step;
    if next >= 1.0 - ENVELOPE_EPSILON {
        1.0
    } else {
        next
    }
}

fn step_down(envelope: f32, step: f32) -> f32 {
    let next = envelope - step;
    if next <= ENVELOPE_EPSILON {
        0.0
    } else {
        next
    }
}
