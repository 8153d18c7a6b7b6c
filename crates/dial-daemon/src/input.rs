use std::path::PathBuf;
use std::time::Duration;

use dial_proto::config::{InputConfig, SourceConfig};
use tracing::{debug, info, warn};

/// A raw control reading on the 0..100 scale.
#[allow(async_fn_in_trait)]
pub trait ControlSource {
    async fn read(&mut self) -> anyhow::Result<f32>;
}

/// Constant reading, for setups without that control.
pub struct FixedSource(pub f32);

impl ControlSource for FixedSource {
    async fn read(&mut self) -> anyhow::Result<f32> {
        Ok(self.0)
    }
}

/// Numeric text file, e.g. a sysfs ADC node.  `full_scale` maps to 100.
pub struct FileSource {
    path: PathBuf,
    full_scale: f32,
}

impl FileSource {
    pub fn new(path: PathBuf, full_scale: f32) -> Self {
        Self { path, full_scale }
    }
}

impl ControlSource for FileSource {
    async fn read(&mut self) -> anyhow::Result<f32> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let raw: f32 = text
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{:?}: bad reading {:?}: {}", self.path, text.trim(), e))?;
        Ok(raw / self.full_scale * 100.0)
    }
}

/// Source selected by configuration.
pub enum Source {
    Fixed(FixedSource),
    File(FileSource),
}

impl Source {
    pub fn from_config(config: &SourceConfig) -> Self {
        match config {
            SourceConfig::Fixed { value } => Source::Fixed(FixedSource(*value)),
            SourceConfig::File { path, full_scale } => {
                Source::File(FileSource::new(path.clone(), *full_scale))
            }
        }
    }
}

impl ControlSource for Source {
    async fn read(&mut self) -> anyhow::Result<f32> {
        match self {
            Source::Fixed(s) => s.read().await,
            Source::File(s) => s.read().await,
        }
    }
}

/// Wraps a source with a read timeout and a last-known-good latch.
///
/// A read that fails, times out, is not finite or falls outside 0..=100
/// yields the previous good value (or the configured default if there has
/// never been one).  The latch never resets on its own.
pub struct LatchedInput<S> {
    name: &'static str,
    source: S,
    timeout: Duration,
    default: f32,
    last_good: Option<f32>,
    failures: u32,
}

impl<S: ControlSource> LatchedInput<S> {
    pub fn new(name: &'static str, source: S, timeout: Duration, default: f32) -> Self {
        Self {
            name,
            source,
            timeout,
            default: default.clamp(0.0, 100.0),
            last_good: None,
            failures: 0,
        }
    }

    /// Seed the latch, e.g. from the persisted state of the previous run.
    pub fn with_last_good(mut self, value: Option<f32>) -> Self {
        self.last_good = value.filter(|v| v.is_finite() && (0.0..=100.0).contains(v));
        self
    }

    pub fn last_good(&self) -> Option<f32> {
        self.last_good
    }

    /// Current value.  Never fails and never waits longer than the timeout.
    pub async fn read(&mut self) -> f32 {
        let outcome = match tokio::time::timeout(self.timeout, self.source.read()).await {
            Ok(Ok(v)) if v.is_finite() && (0.0..=100.0).contains(&v) => Ok(v),
            Ok(Ok(v)) => Err(format!("out-of-range reading {}", v)),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("no reading within {:?}", self.timeout)),
        };

        match outcome {
            Ok(v) => {
                if self.failures > 0 {
                    info!("input {}: recovered after {} failed reads", self.name, self.failures);
                    self.failures = 0;
                }
                self.last_good = Some(v);
                v
            }
            Err(reason) => {
                self.failures = self.failures.saturating_add(1);
                let held = self.last_good.unwrap_or(self.default);
                if self.failures == 1 {
                    warn!("input {}: {}, holding {:.1}", self.name, reason, held);
                } else {
                    debug!("input {}: {} (failure #{})", self.name, reason, self.failures);
                }
                held
            }
        }
    }
}

impl LatchedInput<Source> {
    pub fn from_config(name: &'static str, config: &InputConfig, timeout: Duration) -> Self {
        Self::new(name, Source::from_config(&config.source), timeout, config.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays a script of readings; `None` is a failed read.
    struct Scripted(VecDeque<Option<f32>>);

    impl ControlSource for Scripted {
        async fn read(&mut self) -> anyhow::Result<f32> {
            match self.0.pop_front().flatten() {
                Some(v) => Ok(v),
                None => anyhow::bail!("sensor unreachable"),
            }
        }
    }

    struct Stalled;

    impl ControlSource for Stalled {
        async fn read(&mut self) -> anyhow::Result<f32> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(50.0)
        }
    }

    fn latched<S: ControlSource>(source: S, default: f32) -> LatchedInput<S> {
        LatchedInput::new("test", source, Duration::from_millis(20), default)
    }

    #[tokio::test]
    async fn test_failures_hold_last_good() {
        let script = [Some(40.0), None, Some(f32::NAN), Some(140.0), None, Some(60.0)];
        let mut input = latched(Scripted(script.into_iter().collect()), 0.0);
        assert_eq!(input.read().await, 40.0);
        for _ in 0..4 {
            assert_eq!(input.read().await, 40.0);
        }
        assert_eq!(input.read().await, 60.0);
        // script exhausted: frozen at the last good value indefinitely
        for _ in 0..100 {
            assert_eq!(input.read().await, 60.0);
        }
    }

    #[tokio::test]
    async fn test_default_before_first_good_read() {
        let mut input = latched(Scripted(VecDeque::new()), 100.0);
        assert_eq!(input.read().await, 100.0);
    }

    #[tokio::test]
    async fn test_seeded_value_beats_default() {
        let mut input =
            latched(Scripted(VecDeque::new()), 0.0).with_last_good(Some(72.0));
        assert_eq!(input.read().await, 72.0);

        let input = latched(Scripted(VecDeque::new()), 0.0).with_last_good(Some(-3.0));
        assert_eq!(input.last_good(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_source_times_out() {
        let mut input = latched(Stalled, 0.0).with_last_good(Some(33.0));
        assert_eq!(input.read().await, 33.0);
    }

    #[tokio::test]
    async fn test_file_source_scales() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("in_voltage0_raw");
        std::fs::write(&path, "2048\n").unwrap();
        let mut src = FileSource::new(path.clone(), 4096.0);
        assert_eq!(src.read().await.unwrap(), 50.0);

        std::fs::write(&path, "garbage").unwrap();
        assert!(src.read().await.is_err());
    }
}
