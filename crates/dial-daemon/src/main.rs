mod backend;
mod core;
mod crossfade;
mod dial;
mod indicator;
mod input;
mod mixer;
mod mpv;
mod mpv_backend;
mod overlay;
mod watchdog;

use std::path::PathBuf;

use clap::Parser;
use dial_proto::config::{BackendKind, Config};
use dial_proto::registry::StationRegistry;
use dial_proto::state::StateStore;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::backend::PlaybackBackend;
use crate::core::{CoreEvent, DialCore};
use crate::indicator::Indicator;
use crate::input::LatchedInput;
use crate::mixer::MixerBackend;
use crate::mpv_backend::MpvBackend;

/// Station-dial radio: crossfades looping tracks under a physical dial and
/// layers timed overlay events on top.
#[derive(Parser, Debug)]
#[command(name = "dial-radio", version, about)]
struct Args {
    /// Config file (created with defaults if missing).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Look for mpv on PATH only, never beside the executable.
    #[arg(long)]
    system_deps: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dial_proto::platform::set_use_system_deps(args.system_deps);

    // Setup file logging + stderr
    let data_dir = dial_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,dial_daemon=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config_path = args.config.unwrap_or_else(Config::config_path);
    let config = Config::load_from(&config_path)?;
    config.validate()?;
    info!("Config loaded from: {:?}", config_path);

    let registry = StationRegistry::from_config(&config.stations, &config.playback.media_dir)?;
    for station in registry.stations() {
        info!(
            "station {:02}: {} ({:?})",
            station.index, station.name, station.class
        );
    }

    // Every signal funnels into the core's event channel
    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(16);
    spawn_signal_listeners(event_tx);

    match config.playback.backend {
        BackendKind::Mpv => {
            let backend = MpvBackend::new(&config.playback);
            run_core(&config, registry, backend, event_rx).await
        }
        BackendKind::Mixer => {
            let backend = MixerBackend::new(&config.playback)?;
            run_core(&config, registry, backend, event_rx).await
        }
    }
}

async fn run_core<B: PlaybackBackend>(
    config: &Config,
    registry: StationRegistry,
    backend: B,
    event_rx: mpsc::Receiver<CoreEvent>,
) -> anyhow::Result<()> {
    let saved = StateStore::new(config.daemon.state_file.clone()).load();
    let timeout = config.control.input_timeout();
    let dial = LatchedInput::from_config("dial", &config.control.dial, timeout)
        .with_last_good(saved.dial);
    let volume = LatchedInput::from_config("volume", &config.control.volume, timeout)
        .with_last_good(saved.volume);
    let indicator = Indicator::from_config(&config.indicator.sink);

    let core = DialCore::new(
        config,
        registry,
        backend,
        dial,
        volume,
        indicator,
        Instant::now(),
    );
    info!("Daemon initialised, running event loop");
    core.run(event_rx).await
}

fn spawn_signal_listeners(event_tx: mpsc::Sender<CoreEvent>) {
    let tx = event_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(CoreEvent::Shutdown).await;
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, event) in [
            (SignalKind::user_defined1(), CoreEvent::SkipOverlay),
            (SignalKind::user_defined2(), CoreEvent::TriggerOverlay),
        ] {
            let tx = event_tx.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        while stream.recv().await.is_some() {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(e) => error!("cannot listen for {:?}: {}", event, e),
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
