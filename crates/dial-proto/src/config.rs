use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::platform;
use crate::error::ConfigError;
use crate::model::{Classification, MediaRef, Rgb, Track};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub stations: StationsConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub indicator: IndicatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Last-known control readings, restored on the next start.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

/// Where the dial's stations come from.  Priority: `stations_toml` file,
/// then the inline `list`, then the alternating `signal`/`noise` layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Optional external TOML file with `[[station]]` tables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stations_toml: Option<PathBuf>,
    /// Explicit station list, in dial order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<StationEntry>,
    /// Number of dial slots for the alternating layout.
    #[serde(default = "default_slots")]
    pub slots: usize,
    /// Signal tracks; even slots cycle through these.
    #[serde(default = "default_signal_tracks")]
    pub signal: Vec<MediaRef>,
    /// Noise tracks; odd slots cycle through these.
    #[serde(default = "default_noise_tracks")]
    pub noise: Vec<MediaRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationEntry {
    #[serde(default)]
    pub name: Option<String>,
    pub media: MediaRef,
    #[serde(default)]
    pub class: Classification,
}

/// What happens to the base crossfade while an overlay event is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BasePolicy {
    /// Base keeps following the dial; the overlay is layered on top.
    #[default]
    Continue,
    /// Base channels are silenced until the event returns to idle.
    Mute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
    #[serde(default = "default_hold_secs")]
    pub hold_secs: f64,
    /// Envelope change per tick, in (0, 1].
    #[serde(default = "default_fade_step")]
    pub fade_step: f32,
    /// Overlay gain cap as a fraction of master volume.
    #[serde(default = "default_gain_ceiling")]
    pub gain_ceiling: f32,
    #[serde(default)]
    pub base_policy: BasePolicy,
    #[serde(default = "default_effect_tracks")]
    pub effects: Vec<MediaRef>,
    #[serde(default = "default_blend_tracks")]
    pub blends: Vec<Track>,
}

impl OverlayConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn hold(&self) -> Duration {
        Duration::from_secs_f64(self.hold_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// One external mpv process per channel, driven over JSON IPC.
    #[default]
    Mpv,
    /// In-process sample mixer (WAV clips).
    Mixer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Only the two stations adjacent to the dial are loaded.
    #[default]
    Lazy,
    /// Every station is loaded muted at startup.
    Eager,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub load_mode: LoadMode,
    /// Base directory for relative media references.
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    /// Played instead of any media that cannot be loaded.
    #[serde(default = "default_fallback_media")]
    pub fallback_media: MediaRef,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_watchdog_backoff_ms")]
    pub watchdog_backoff_ms: u64,
    /// Idle mpv players kept around for reuse after a release.
    #[serde(default = "default_spare_players")]
    pub spare_players: usize,
}

impl PlaybackConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn watchdog_backoff(&self) -> Duration {
        Duration::from_millis(self.watchdog_backoff_ms)
    }

    pub fn fallback(&self) -> MediaRef {
        self.fallback_media.resolve(&self.media_dir)
    }
}

/// A control input source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Constant reading (no hardware attached).
    Fixed { value: f32 },
    /// Numeric file such as a sysfs ADC node; `full_scale` maps to 100.
    File {
        path: PathBuf,
        #[serde(default = "default_full_scale")]
        full_scale: f32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// Reading used when the source has never produced a good value.
    #[serde(default)]
    pub default: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_input_timeout_ms")]
    pub input_timeout_ms: u64,
    /// Exponent applied to the normalised master volume (1.0 = linear).
    #[serde(default = "default_volume_curve")]
    pub volume_curve: f32,
    #[serde(default = "default_dial_input")]
    pub dial: InputConfig,
    #[serde(default = "default_volume_input")]
    pub volume: InputConfig,
}

impl ControlConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Colour changes go to the debug log.
    #[default]
    Log,
    /// `r g b` lines written to a file or FIFO.
    File { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default = "default_signal_color")]
    pub signal: Rgb,
    #[serde(default = "default_noise_color")]
    pub noise: Rgb,
    #[serde(default = "default_alert_color")]
    pub alert: Rgb,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: None,
            list: Vec::new(),
            slots: default_slots(),
            signal: default_signal_tracks(),
            noise: default_noise_tracks(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            hold_secs: default_hold_secs(),
            fade_step: default_fade_step(),
            gain_ceiling: default_gain_ceiling(),
            base_policy: BasePolicy::default(),
            effects: default_effect_tracks(),
            blends: default_blend_tracks(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            load_mode: LoadMode::default(),
            media_dir: default_media_dir(),
            fallback_media: default_fallback_media(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            watchdog_backoff_ms: default_watchdog_backoff_ms(),
            spare_players: default_spare_players(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            input_timeout_ms: default_input_timeout_ms(),
            volume_curve: default_volume_curve(),
            dial: default_dial_input(),
            volume: default_volume_input(),
        }
    }
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            sink: SinkConfig::default(),
            signal: default_signal_color(),
            noise: default_noise_color(),
            alert: default_alert_color(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_slots() -> usize {
    16
}

fn default_signal_tracks() -> Vec<MediaRef> {
    (1..=12)
        .map(|n| MediaRef::new(format!("ch{}.ogg", n)))
        .collect()
}

fn default_noise_tracks() -> Vec<MediaRef> {
    ["AM-Static.mp3", "Radio-Static.mp3", "AllStaticChatterPlanet.ogg"]
        .iter()
        .map(|s| MediaRef::from(*s))
        .collect()
}

fn default_effect_tracks() -> Vec<MediaRef> {
    ["roar.mp3", "Scream1.mp3", "scream2.mp3", "zombscream.mp3"]
        .iter()
        .map(|s| MediaRef::from(*s))
        .collect()
}

fn default_blend_tracks() -> Vec<Track> {
    let mut blends: Vec<Track> = default_noise_tracks()
        .into_iter()
        .map(|media| Track {
            media,
            class: Classification::Noise,
        })
        .collect();
    blends.push(Track {
        media: MediaRef::from("Nasa.mp3"),
        class: Classification::Signal,
    });
    blends
}

fn default_interval_secs() -> f64 {
    60.0
}

fn default_hold_secs() -> f64 {
    5.0
}

fn default_fade_step() -> f32 {
    0.05
}

fn default_gain_ceiling() -> f32 {
    0.5
}

fn default_media_dir() -> PathBuf {
    platform::data_dir().join("media")
}

fn default_fallback_media() -> MediaRef {
    MediaRef::from("AM-Static.mp3")
}

fn default_acquire_timeout_ms() -> u64 {
    2000
}

fn default_watchdog_backoff_ms() -> u64 {
    2000
}

fn default_spare_players() -> usize {
    2
}

fn default_tick_ms() -> u64 {
    50
}

fn default_input_timeout_ms() -> u64 {
    20
}

fn default_volume_curve() -> f32 {
    1.0
}

fn default_full_scale() -> f32 {
    100.0
}

fn default_dial_input() -> InputConfig {
    InputConfig {
        source: SourceConfig::Fixed { value: 0.0 },
        default: 0.0,
    }
}

fn default_volume_input() -> InputConfig {
    InputConfig {
        source: SourceConfig::Fixed { value: 100.0 },
        default: 100.0,
    }
}

fn default_signal_color() -> Rgb {
    Rgb(0, 255, 0)
}

fn default_noise_color() -> Rgb {
    Rgb(255, 0, 0)
}

fn default_alert_color() -> Rgb {
    Rgb(128, 0, 128)
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            tracing::info!("config: wrote defaults to {:?}", path);
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Check every option that would make a clean start impossible.  Station
    /// count is checked when the registry is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let o = &self.overlay;
        if o.effects.is_empty() {
            return Err(ConfigError::EmptyEffectPool);
        }
        if o.blends.is_empty() {
            return Err(ConfigError::EmptyBlendPool);
        }
        if !o.blends.iter().any(|t| t.class == Classification::Noise) {
            return Err(ConfigError::BlendPoolWithoutNoise);
        }
        if !(o.fade_step > 0.0 && o.fade_step <= 1.0) {
            return Err(ConfigError::invalid(
                "overlay.fade_step",
                format!("{} is outside (0, 1]", o.fade_step),
            ));
        }
        if !(0.0..=1.0).contains(&o.gain_ceiling) {
            return Err(ConfigError::invalid(
                "overlay.gain_ceiling",
                format!("{} is outside [0, 1]", o.gain_ceiling),
            ));
        }
        if !(o.interval_secs.is_finite() && o.interval_secs > 0.0) {
            return Err(ConfigError::invalid(
                "overlay.interval_secs",
                "must be a positive number of seconds",
            ));
        }
        if !(o.hold_secs.is_finite() && o.hold_secs >= 0.0) {
            return Err(ConfigError::invalid(
                "overlay.hold_secs",
                "must be zero or a positive number of seconds",
            ));
        }
        if self.control.tick_ms == 0 {
            return Err(ConfigError::invalid("control.tick_ms", "must be > 0"));
        }
        if !(self.control.volume_curve.is_finite() && self.control.volume_curve > 0.0) {
            return Err(ConfigError::invalid(
                "control.volume_curve",
                "must be a positive exponent",
            ));
        }
        for (option, input) in [
            ("control.dial", &self.control.dial),
            ("control.volume", &self.control.volume),
        ] {
            if let SourceConfig::File { full_scale, .. } = input.source {
                if !(full_scale.is_finite() && full_scale > 0.0) {
                    return Err(ConfigError::invalid(option, "full_scale must be > 0"));
                }
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            stations: StationsConfig::default(),
            overlay: OverlayConfig::default(),
            playback: PlaybackConfig::default(),
            control: ControlConfig::default(),
            indicator: IndicatorConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.control.tick_ms, 50);
        assert_eq!(config.overlay.interval(), Duration::from_secs(60));
        assert_eq!(config.overlay.hold(), Duration::from_secs(5));
        assert_eq!(config.overlay.gain_ceiling, 0.5);
        assert_eq!(config.overlay.base_policy, BasePolicy::Continue);
        assert_eq!(config.stations.slots, 16);
        assert_eq!(config.control.dial.default, 0.0);
        assert_eq!(config.control.volume.default, 100.0);
        assert!(config.playback.media_dir.ends_with("media"));
        config.validate().unwrap();
    }

    #[test]
    fn test_default_config_roundtrips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.indicator.alert, Rgb(128, 0, 128));
        assert_eq!(parsed.control.volume.source, SourceConfig::Fixed { value: 100.0 });
    }

    #[test]
    fn test_input_table_without_default_reading() {
        let text = r#"
            [control.dial]
            kind = "file"
            path = "/sys/bus/iio/devices/iio:device0/in_voltage0_raw"

            [control.volume]
            kind = "fixed"
            value = 40.0
        "#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.control.dial.default, 0.0);
        assert_eq!(
            config.control.volume.source,
            SourceConfig::Fixed { value: 40.0 }
        );
        assert_eq!(config.control.volume.default, 0.0);
        assert!(matches!(
            config.control.dial.source,
            SourceConfig::File { full_scale, .. } if full_scale == default_full_scale()
        ));
    }

    #[test]
    fn test_blend_pool_needs_noise() {
        let mut config = Config::default();
        for t in &mut config.overlay.blends {
            t.class = Classification::Signal;
        }
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BlendPoolWithoutNoise)
        ));
    }

    #[test]
    fn test_empty_pools_rejected() {
        let mut config = Config::default();
        config.overlay.effects.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyEffectPool)));

        let mut config = Config::default();
        config.overlay.blends.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyBlendPool)));
    }

    #[test]
    fn test_fade_step_bounds() {
        let mut config = Config::default();
        config.overlay.fade_step = 0.0;
        assert!(config.validate().is_err());
        config.overlay.fade_step = 1.0;
        assert!(config.validate().is_ok());
    }
}
