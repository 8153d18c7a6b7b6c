use std::path::Path;

use tracing::debug;

use crate::config::{StationEntry, StationsConfig};
use crate::error::ConfigError;
use crate::model::{Classification, MediaRef, Station};

/// Ordered, immutable catalogue of dial stations.  Index `i` is dial slot `i`.
#[derive(Debug, Clone)]
pub struct StationRegistry {
    stations: Vec<Station>,
}

impl StationRegistry {
    /// Build a registry from an ordered list.  Crossfading needs two
    /// endpoints, so fewer than two stations is a configuration error.
    pub fn new(stations: Vec<Station>) -> Result<Self, ConfigError> {
        if stations.len() < 2 {
            return Err(ConfigError::TooFewStations(stations.len()));
        }
        let stations = stations
            .into_iter()
            .enumerate()
            .map(|(index, s)| Station { index, ..s })
            .collect();
        Ok(Self { stations })
    }

    /// Build from the `[stations]` section, resolving relative media against
    /// `media_dir`.
    pub fn from_config(config: &StationsConfig, media_dir: &Path) -> Result<Self, ConfigError> {
        let entries = if let Some(path) = &config.stations_toml {
            debug!("registry: loading stations from {:?}", path);
            load_station_file(path)?
        } else if !config.list.is_empty() {
            config.list.clone()
        } else {
            debug!("registry: alternating layout over {} slots", config.slots);
            alternating_layout(config.slots, &config.signal, &config.noise)
        };

        let stations = entries
            .into_iter()
            .enumerate()
            .map(|(index, e)| {
                let media = e.media.resolve(media_dir);
                Station {
                    index,
                    name: e.name.unwrap_or_else(|| e.media.label().to_string()),
                    media,
                    class: e.class,
                }
            })
            .collect();
        Self::new(stations)
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn get(&self, index: usize) -> Option<&Station> {
        self.stations.get(index)
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    /// Always false for a constructed registry; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}

/// Lay out `slots` stations alternating signal (even) and noise (odd),
/// cycling through each list.  An empty list lets the other fill every slot.
pub fn alternating_layout(
    slots: usize,
    signal: &[MediaRef],
    noise: &[MediaRef],
) -> Vec<StationEntry> {
    let mut sig = signal.iter().cycle();
    let mut noi = noise.iter().cycle();
    let mut out = Vec::with_capacity(slots);
    for n in 0..slots {
        let pick = if n % 2 == 0 {
            sig.next()
                .map(|m| (m, Classification::Signal))
                .or_else(|| noi.next().map(|m| (m, Classification::Noise)))
        } else {
            noi.next()
                .map(|m| (m, Classification::Noise))
                .or_else(|| sig.next().map(|m| (m, Classification::Signal)))
        };
        match pick {
            Some((media, class)) => out.push(StationEntry {
                name: None,
                media: media.clone(),
                class,
            }),
            None => break,
        }
    }
    out
}

// ── TOML station file ─────────────────────────────────────────────────────────

/// Intermediate struct that matches the TOML `[[station]]` table.
/// Kept separate from `StationEntry` so the file schema can grow without
/// touching the config schema.
#[derive(Debug, serde::Deserialize)]
struct TomlStationFile {
    #[serde(default)]
    station: Vec<TomlStation>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlStation {
    #[serde(default)]
    name: String,
    media: String,
    #[serde(default)]
    class: Classification,
}

pub fn load_station_file(path: &Path) -> Result<Vec<StationEntry>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::StationFileIo {
        path: path.to_path_buf(),
        source,
    })?;
    parse_station_file_str(&content).map_err(|source| ConfigError::StationFileParse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_station_file_str(content: &str) -> Result<Vec<StationEntry>, toml::de::Error> {
    let file: TomlStationFile = toml::from_str(content)?;
    Ok(file
        .station
        .into_iter()
        .map(|s| StationEntry {
            name: if s.name.is_empty() { None } else { Some(s.name) },
            media: MediaRef::new(s.media),
            class: s.class,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(names: &[&str]) -> Vec<MediaRef> {
        names.iter().map(|n| MediaRef::from(*n)).collect()
    }

    #[test]
    fn test_alternating_layout_cycles_lists() {
        let entries = alternating_layout(6, &media(&["a", "b"]), &media(&["x"]));
        let names: Vec<&str> = entries.iter().map(|e| e.media.as_str()).collect();
        assert_eq!(names, ["a", "x", "b", "x", "a", "x"]);
        assert_eq!(entries[0].class, Classification::Signal);
        assert_eq!(entries[1].class, Classification::Noise);
    }

    #[test]
    fn test_alternating_layout_with_one_empty_list() {
        let entries = alternating_layout(3, &media(&["a"]), &[]);
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.class == Classification::Signal));
        assert!(alternating_layout(4, &[], &[]).is_empty());
    }

    #[test]
    fn test_registry_rejects_single_station() {
        let one = vec![Station {
            index: 0,
            name: "only".into(),
            media: MediaRef::from("only.ogg"),
            class: Classification::Signal,
        }];
        assert!(matches!(
            StationRegistry::new(one),
            Err(ConfigError::TooFewStations(1))
        ));
    }

    #[test]
    fn test_parse_station_file() {
        let entries = parse_station_file_str(
            r#"
            [[station]]
            name = "Numbers"
            media = "numbers.ogg"

            [[station]]
            media = "hiss.ogg"
            class = "noise"
            "#,
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name.as_deref(), Some("Numbers"));
        assert_eq!(entries[0].class, Classification::Signal);
        assert_eq!(entries[1].name, None);
        assert_eq!(entries[1].class, Classification::Noise);
    }
}
