use std::path::{Path, PathBuf};
use std::time::Duration;

use dial_proto::config::{IndicatorConfig, SinkConfig};
use dial_proto::model::{Classification, Rgb};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Indicator colours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Palette {
    pub signal: Rgb,
    pub noise: Rgb,
    pub alert: Rgb,
}

impl Palette {
    pub fn from_config(config: &IndicatorConfig) -> Self {
        Self {
            signal: config.signal,
            noise: config.noise,
            alert: config.alert,
        }
    }

    /// Colour for the audible mix.  An active overlay always shows the alert
    /// colour; otherwise the noise→signal blend follows the signal weight of
    /// the two adjacent stations.
    pub fn color(
        &self,
        floor: Classification,
        ceil: Classification,
        t: f32,
        overlay_active: bool,
    ) -> Rgb {
        if overlay_active {
            return self.alert;
        }
        self.noise.lerp(self.signal, signal_weight(floor, ceil, t))
    }
}

/// `(floor Signal ? 1−t : 0) + (ceil Signal ? t : 0)`, clamped to 0..=1.
pub fn signal_weight(floor: Classification, ceil: Classification, t: f32) -> f32 {
    let mut w = 0.0;
    if floor.is_signal() {
        w += 1.0 - t;
    }
    if ceil.is_signal() {
        w += t;
    }
    w.clamp(0.0, 1.0)
}

/// Where indicator colours go.  Fire-and-forget: implementations must not
/// block the tick.
pub trait IndicatorSink {
    fn show(&mut self, color: Rgb);
    fn clear(&mut self);
}

/// Logs colour changes at debug level.
#[derive(Default)]
pub struct LogSink {
    last: Option<Rgb>,
}

impl IndicatorSink for LogSink {
    fn show(&mut self, color: Rgb) {
        if self.last != Some(color) {
            debug!("indicator: {}", color);
            self.last = Some(color);
        }
    }

    fn clear(&mut self) {
        self.last = None;
        debug!("indicator: cleared");
    }
}

/// How long `close` waits for queued writes before abandoning them.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Writes `r g b` lines to a file (or FIFO) from a background task.  Only
/// colour changes are queued; a full queue drops the update.
pub struct FileSink {
    tx: mpsc::Sender<Rgb>,
    last: Option<Rgb>,
    writer: Option<tokio::task::JoinHandle<()>>,
}

impl FileSink {
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<Rgb>(16);
        let writer = tokio::spawn(async move {
            while let Some(color) = rx.recv().await {
                if let Err(e) = write_line(&path, &format!("{}\n", color)).await {
                    debug!("indicator: write to {:?} failed: {}", path, e);
                }
            }
        });
        Self {
            tx,
            last: None,
            writer: Some(writer),
        }
    }

    /// Let queued writes drain, then stop the writer task.  Writes still
    /// pending after [`CLOSE_GRACE`] are dropped.
    pub async fn close(self) {
        let FileSink { tx, writer, .. } = self;
        drop(tx);
        let Some(mut writer) = writer else {
            return;
        };
        if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
            warn!("indicator: writer still busy after {:?}, abandoning it", CLOSE_GRACE);
            writer.abort();
        }
    }
}

/// A FIFO is opened non-blocking and written with a single `try_write`: no
/// reader, or a full pipe, drops the line.
#[cfg(unix)]
async fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
    use std::os::unix::fs::FileTypeExt;
    use tokio::net::unix::pipe;

    let is_fifo = tokio::fs::metadata(path)
        .await
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false);
    if !is_fifo {
        return tokio::fs::write(path, line).await;
    }

    let sender = pipe::OpenOptions::new().open_sender(path)?;
    let written = sender.try_write(line.as_bytes())?;
    if written < line.len() {
        debug!("indicator: short write to {:?}", path);
    }
    Ok(())
}

#[cfg(not(unix))]
async fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
    tokio::fs::write(path, line).await
}

impl IndicatorSink for FileSink {
    fn show(&mut self, color: Rgb) {
        if self.last == Some(color) {
            return;
        }
        if self.tx.try_send(color).is_ok() {
            self.last = Some(color);
        }
    }

    fn clear(&mut self) {
        if self.tx.try_send(Rgb::BLACK).is_err() {
            warn!("indicator: could not queue clear");
        }
        self.last = Some(Rgb::BLACK);
    }
}

/// Sink selected by configuration.
pub enum Indicator {
    Log(LogSink),
    File(FileSink),
}

impl Indicator {
    pub fn from_config(config: &SinkConfig) -> Self {
        match config {
            SinkConfig::Log => Indicator::Log(LogSink::default()),
            SinkConfig::File { path } => Indicator::File(FileSink::spawn(path.clone())),
        }
    }

    /// Flush pending output.  Call after the final `clear`; returns within
    /// [`CLOSE_GRACE`] even when the sink has no reader.
    pub async fn close(self) {
        if let Indicator::File(sink) = self {
            sink.close().await;
        }
    }
}

impl IndicatorSink for Indicator {
    fn show(&mut self, color: Rgb) {
        match self {
            Indicator::Log(s) => s.show(color),
            Indicator::File(s) => s.show(color),
        }
    }

    fn clear(&mut self) {
        match self {
            Indicator::Log(s) => s.clear(),
            Indicator::File(s) => s.clear(),
        }
    }
}
