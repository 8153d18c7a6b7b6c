use dial_proto::config::{BackendKind, BasePolicy, Config, LoadMode, SinkConfig, SourceConfig};
use dial_proto::error::ConfigError;
use dial_proto::model::{Classification, Rgb};
use dial_proto::registry::StationRegistry;
use dial_proto::state::{PersistentState, StateStore};
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn missing_config_file_is_created_with_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let config = Config::load_from(&path).expect("defaults should load");
    assert!(path.exists(), "default config should be written on first run");
    assert_eq!(config.control.tick_ms, 50);

    let reloaded = Config::load_from(&path).unwrap();
    assert_eq!(reloaded.overlay.effects, config.overlay.effects);
}

#[test]
fn partial_config_fills_in_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
        [overlay]
        interval_secs = 30.0
        base_policy = "mute"

        [playback]
        backend = "mixer"
        load_mode = "eager"
        media_dir = "/srv/radio"

        [control.dial]
        kind = "file"
        path = "/sys/bus/iio/devices/iio:device0/in_voltage0_raw"
        full_scale = 4095
        default = 0

        [indicator]
        sink = { kind = "file", path = "/run/leds" }
        signal = [0, 0, 255]
        "#,
    )
    .unwrap();

    let config = Config::load_from(&path).unwrap();
    assert_eq!(config.overlay.interval_secs, 30.0);
    assert_eq!(config.overlay.hold_secs, 5.0);
    assert_eq!(config.overlay.base_policy, BasePolicy::Mute);
    assert_eq!(config.playback.backend, BackendKind::Mixer);
    assert_eq!(config.playback.load_mode, LoadMode::Eager);
    assert_eq!(
        config.control.dial.source,
        SourceConfig::File {
            path: PathBuf::from("/sys/bus/iio/devices/iio:device0/in_voltage0_raw"),
            full_scale: 4095.0,
        }
    );
    assert_eq!(config.control.volume.default, 100.0);
    assert_eq!(
        config.indicator.sink,
        SinkConfig::File {
            path: PathBuf::from("/run/leds")
        }
    );
    assert_eq!(config.indicator.signal, Rgb(0, 0, 255));
    assert_eq!(config.indicator.noise, Rgb(255, 0, 0));
    assert_eq!(
        config.playback.fallback().as_str(),
        "/srv/radio/AM-Static.mp3"
    );
    config.validate().unwrap();
}

#[test]
fn default_layout_builds_sixteen_alternating_stations() {
    let config = Config::default();
    let registry =
        StationRegistry::from_config(&config.stations, &PathBuf::from("/srv/radio")).unwrap();

    assert_eq!(registry.len(), 16);
    for station in registry.stations() {
        let expected = if station.index % 2 == 0 {
            Classification::Signal
        } else {
            Classification::Noise
        };
        assert_eq!(station.class, expected, "slot {}", station.index);
        assert!(station.media.as_str().starts_with("/srv/radio/"));
    }
    assert_eq!(registry.get(0).unwrap().name, "ch1.ogg");
    assert_eq!(registry.get(1).unwrap().name, "AM-Static.mp3");
    assert_eq!(registry.get(14).unwrap().name, "ch8.ogg");
}

#[test]
fn station_file_takes_priority() {
    let dir = TempDir::new().unwrap();
    let stations = dir.path().join("stations.toml");
    std::fs::write(
        &stations,
        r#"
        [[station]]
        name = "Lincolnshire Poacher"
        media = "poacher.ogg"

        [[station]]
        media = "http://example.invalid/hiss.mp3"
        class = "noise"

        [[station]]
        media = "/abs/chatter.ogg"
        "#,
    )
    .unwrap();

    let mut config = Config::default();
    config.stations.stations_toml = Some(stations);
    let registry = StationRegistry::from_config(&config.stations, dir.path()).unwrap();

    assert_eq!(registry.len(), 3);
    assert_eq!(registry.get(0).unwrap().name, "Lincolnshire Poacher");
    assert_eq!(
        registry.get(0).unwrap().media.as_str(),
        dir.path().join("poacher.ogg").to_string_lossy()
    );
    assert_eq!(registry.get(1).unwrap().class, Classification::Noise);
    assert_eq!(
        registry.get(1).unwrap().media.as_str(),
        "http://example.invalid/hiss.mp3"
    );
    assert_eq!(registry.get(2).unwrap().media.as_str(), "/abs/chatter.ogg");
}

#[test]
fn too_few_stations_is_fatal() {
    let mut config = Config::default();
    config.stations.slots = 1;
    let err = StationRegistry::from_config(&config.stations, &PathBuf::from("/srv")).unwrap_err();
    assert!(matches!(err, ConfigError::TooFewStations(1)));
}

#[test]
fn unreadable_station_file_is_fatal() {
    let mut config = Config::default();
    config.stations.stations_toml = Some(PathBuf::from("/definitely/not/here.toml"));
    let err = StationRegistry::from_config(&config.stations, &PathBuf::from("/srv")).unwrap_err();
    assert!(matches!(err, ConfigError::StationFileIo { .. }));
}

#[tokio::test]
async fn state_store_roundtrip_and_corrupt_file() {
    let dir = TempDir::new().unwrap();
    let store = StateStore::new(dir.path().join("state").join("state.json"));
    assert_eq!(store.load(), PersistentState::default());

    let state = PersistentState {
        dial: Some(42.5),
        volume: Some(80.0),
    };
    store.save(&state).await.unwrap();
    assert_eq!(store.load(), state);

    std::fs::write(store.path(), "{ not json").unwrap();
    assert_eq!(store.load(), PersistentState::default());
}
