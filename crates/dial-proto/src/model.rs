use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// What a station (or overlay blend track) sounds like.  Drives the indicator
/// colour only; playback treats both kinds identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    #[default]
    Signal,
    Noise,
}

impl Classification {
    pub fn is_signal(self) -> bool {
        self == Classification::Signal
    }
}

/// A media reference: a filesystem path or a URI (`scheme://...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(String);

impl MediaRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for `http://`, `file://` and friends.  Remote media cannot be
    /// checked before loading; the backend finds out when the player fails.
    pub fn is_uri(&self) -> bool {
        self.0.contains("://")
    }

    pub fn as_path(&self) -> Option<&Path> {
        if self.is_uri() {
            None
        } else {
            Some(Path::new(&self.0))
        }
    }

    /// Resolve a relative path against `base`.  URIs and absolute paths are
    /// returned unchanged.
    pub fn resolve(&self, base: &Path) -> MediaRef {
        match self.as_path() {
            Some(p) if p.is_relative() => {
                MediaRef(base.join(p).to_string_lossy().into_owned())
            }
            _ => self.clone(),
        }
    }

    /// Cheap readability check for local files.  URIs are optimistically
    /// reported readable.
    pub fn is_readable(&self) -> bool {
        match self.as_path() {
            Some(p) => std::fs::File::open(p).is_ok(),
            None => true,
        }
    }

    /// Short label for logs: the file name for paths, the full URI otherwise.
    pub fn label(&self) -> &str {
        match self.as_path().and_then(|p| p.file_name()).and_then(|n| n.to_str()) {
            Some(name) => name,
            None => &self.0,
        }
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<PathBuf> for MediaRef {
    fn from(value: PathBuf) -> Self {
        Self(value.to_string_lossy().into_owned())
    }
}

/// One position on the dial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub index: usize,
    /// Display name; defaults to the media label.
    pub name: String,
    pub media: MediaRef,
    pub class: Classification,
}

/// A track in an overlay pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub media: MediaRef,
    #[serde(default)]
    pub class: Classification,
}

/// 8-bit RGB triple pushed to the indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const BLACK: Rgb = Rgb(0, 0, 0);

    /// Linear interpolation from `self` (t = 0) to `other` (t = 1).  Channels
    /// are truncated toward zero; `t` is clamped.
    pub fn lerp(self, other: Rgb, t: f32) -> Rgb {
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let mix = |a: u8, b: u8| -> u8 {
            let v = a as f32 + (b as f32 - a as f32) * t;
            v.clamp(0.0, 255.0) as u8
        };
        Rgb(mix(self.0, other.0), mix(self.1, other.1), mix(self.2, other.2))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.0, self.1, self.2)
    }
}
