//! In-process sample mixer backend.
//!
//! Clips are decoded from WAV with `hound`, then every channel loops its
//! clip on a shared [`MixBus`].  With the `audio-output` feature the bus feeds
//! the default cpal output device; without it the bus still advances but
//! nothing is heard, which is what the tests use.
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dial_proto::config::PlaybackConfig;
use dial_proto::model::MediaRef;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{resolve_media, HandleId, PlaybackBackend};

#[cfg(not(feature = "audio-output"))]
const DEFAULT_RATE: u32 = 44_100;

/// Decoded audio, stereo frames.
#[derive(Debug)]
pub struct Clip {
    frames: Vec<[f32; 2]>,
    rate: u32,
}

impl Clip {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => {
                reader.samples::<f32>().collect::<Result<Vec<f32>, _>>()?
            }
            hound::SampleFormat::Int => {
                let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max_val))
                    .collect::<Result<Vec<f32>, _>>()?
            }
        };

        let frames: Vec<[f32; 2]> = samples
            .chunks_exact(channels)
            .map(|frame| match frame {
                [mono] => [*mono, *mono],
                [l, r, ..] => [*l, *r],
                [] => [0.0, 0.0],
            })
            .collect();
        if frames.is_empty() {
            anyhow::bail!("{:?} contains no audio", path);
        }
        Ok(Self {
            frames,
            rate: spec.sample_rate.max(1),
        })
    }

    /// One second of silence.
    pub fn silence(rate: u32) -> Self {
        Self {
            frames: vec![[0.0, 0.0]; rate.max(1) as usize],
            rate: rate.max(1),
        }
    }
}

struct Voice {
    clip: Arc<Clip>,
    cursor: f64,
    gain: f32,
}

/// Every live channel, rendered into one interleaved buffer.
pub struct MixBus {
    rate: u32,
    voices: HashMap<HandleId, Voice>,
}

impl MixBus {
    pub fn new(rate: u32) -> Self {
        Self {
            rate: rate.max(1),
            voices: HashMap::new(),
        }
    }

    fn insert(&mut self, handle: HandleId, clip: Arc<Clip>) {
        self.voices.insert(
            handle,
            Voice {
                clip,
                cursor: 0.0,
                gain: 0.0,
            },
        );
    }

    fn set_gain(&mut self, handle: HandleId, gain: f32) {
        if let Some(v) = self.voices.get_mut(&handle) {
            v.gain = gain;
        }
    }

    /// Fill `out` (interleaved, `channels` per frame).  Voices keep moving
    /// while silent and wrap at the end of their clip.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        out.fill(0.0);
        for voice in self.voices.values_mut() {
            let len = voice.clip.frames.len();
            if len == 0 {
                continue;
            }
            let step = voice.clip.rate as f64 / self.rate as f64;
            for frame in out.chunks_mut(channels) {
                let [l, r] = voice.clip.frames[voice.cursor as usize % len];
                if voice.gain > 0.0 {
                    match frame {
                        [mono] => *mono += (l + r) * 0.5 * voice.gain,
                        [left, right, ..] => {
                            *left += l * voice.gain;
                            *right += r * voice.gain;
                        }
                        [] => {}
                    }
                }
                voice.cursor = (voice.cursor + step) % len as f64;
            }
        }
        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}

pub struct MixerBackend {
    bus: Arc<Mutex<MixBus>>,
    fallback: MediaRef,
    clips: HashMap<MediaRef, Arc<Clip>>,
    /// Decodes still running on the blocking pool.  A timed-out acquire
    /// leaves its decode here and the next acquire picks it up.
    pending: HashMap<MediaRef, JoinHandle<anyhow::Result<Clip>>>,
    channels: HashMap<HandleId, (MediaRef, f32)>,
    next_handle: u64,
    /// Set by the output callback when the device goes away.
    device_lost: Arc<AtomicBool>,
    #[cfg(feature = "audio-output")]
    output: Option<output::Output>,
}

impl MixerBackend {
    /// Mixer on the default output device.  Without the `audio-output`
    /// feature this is a headless mixer and a warning is logged.
    pub fn new(config: &PlaybackConfig) -> anyhow::Result<Self> {
        #[cfg(feature = "audio-output")]
        {
            let device_lost = Arc::new(AtomicBool::new(false));
            let (output, rate) = output::Output::open(device_lost.clone())?;
            let mut mixer = Self::with_bus(config, MixBus::new(rate), device_lost);
            output.attach(mixer.bus.clone())?;
            mixer.output = Some(output);
            Ok(mixer)
        }
        #[cfg(not(feature = "audio-output"))]
        {
            warn!("mixer: built without audio-output, mixing silently");
            Ok(Self::headless(config, DEFAULT_RATE))
        }
    }

    pub fn headless(config: &PlaybackConfig, rate: u32) -> Self {
        Self::with_bus(config, MixBus::new(rate), Arc::new(AtomicBool::new(false)))
    }

    fn with_bus(config: &PlaybackConfig, bus: MixBus, device_lost: Arc<AtomicBool>) -> Self {
        Self {
            bus: Arc::new(Mutex::new(bus)),
            fallback: config.fallback(),
            clips: HashMap::new(),
            pending: HashMap::new(),
            channels: HashMap::new(),
            next_handle: 0,
            device_lost,
            #[cfg(feature = "audio-output")]
            output: None,
        }
    }

    fn bus(&self) -> MutexGuard<'_, MixBus> {
        self.bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Render `frames` stereo frames from the bus.
    #[cfg(test)]
    fn render(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * 2];
        self.bus().render(&mut out, 2);
        out
    }

    /// Decode `media` from `path`, joining a decode an earlier acquire
    /// already started.  The join handle stays in `pending` until it
    /// resolves, so cancelling this future loses nothing.
    async fn decode(&mut self, media: &MediaRef, path: &Path) -> anyhow::Result<Clip> {
        let decoding = self.pending.entry(media.clone()).or_insert_with(|| {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || Clip::load(&path))
        });
        let joined = decoding.await;
        self.pending.remove(media);
        joined?
    }

    /// Decoded clip for `media`, falling back to the fallback track and then
    /// to silence.
    async fn clip_for(&mut self, media: &MediaRef) -> (MediaRef, Arc<Clip>) {
        let wanted = resolve_media(media, &self.fallback);
        for candidate in [wanted, self.fallback.clone()] {
            if let Some(clip) = self.clips.get(&candidate) {
                return (candidate, clip.clone());
            }
            let Some(path) = candidate.as_path() else {
                warn!("mixer: cannot stream {}", candidate);
                continue;
            };
            match self.decode(&candidate, path).await {
                Ok(clip) => {
                    debug!("mixer: decoded {} ({} frames)", candidate.label(), clip.frames.len());
                    let clip = Arc::new(clip);
                    self.clips.insert(candidate.clone(), clip.clone());
                    return (candidate, clip);
                }
                Err(e) => warn!("mixer: cannot decode {}: {}", candidate.label(), e),
            }
        }
        warn!("mixer: no playable audio for {}, using silence", media.label());
        let rate = self.bus().rate;
        (media.clone(), Arc::new(Clip::silence(rate)))
    }
}

impl PlaybackBackend for MixerBackend {
    async fn acquire(&mut self, media: &MediaRef) -> HandleId {
        let (loaded, clip) = self.clip_for(media).await;
        self.next_handle += 1;
        let handle = HandleId(self.next_handle);
        self.bus().insert(handle, clip);
        info!("mixer: {} playing {}", handle, loaded.label());
        self.channels.insert(handle, (loaded, 0.0));
        handle
    }

    fn set_volume(&mut self, handle: HandleId, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        if let Some((_, v)) = self.channels.get_mut(&handle) {
            *v = volume;
        } else {
            return;
        }
        self.bus().set_gain(handle, volume);
    }

    fn volume(&self, handle: HandleId) -> f32 {
        self.channels.get(&handle).map(|(_, v)| *v).unwrap_or(0.0)
    }

    fn is_alive(&mut self, handle: HandleId) -> bool {
        self.channels.contains_key(&handle) && !self.device_lost.load(Ordering::Relaxed)
    }

    async fn restart(&mut self, handle: HandleId) {
        let Some((media, volume)) = self.channels.get(&handle).cloned() else {
            return;
        };
        #[cfg(feature = "audio-output")]
        if self.device_lost.load(Ordering::Relaxed) {
            match output::Output::open(self.device_lost.clone()) {
                Ok((output, _rate)) => match output.attach(self.bus.clone()) {
                    Ok(()) => {
                        info!("mixer: output device reopened");
                        self.device_lost.store(false, Ordering::Relaxed);
                        self.output = Some(output);
                    }
                    Err(e) => warn!("mixer: cannot restart output: {}", e),
                },
                Err(e) => warn!("mixer: cannot reopen output: {}", e),
            }
        }
        #[cfg(not(feature = "audio-output"))]
        self.device_lost.store(false, Ordering::Relaxed);

        self.clips.remove(&media);
        let (loaded, clip) = self.clip_for(&media).await;
        {
            let mut bus = self.bus();
            bus.insert(handle, clip);
            bus.set_gain(handle, volume);
        }
        self.channels.insert(handle, (loaded, volume));
        debug!("mixer: {} restarted", handle);
    }

    async fn release(&mut self, handle: HandleId) {
        if self.channels.remove(&handle).is_some() {
            self.bus().voices.remove(&handle);
            debug!("mixer: released {}", handle);
        }
    }

    async fn shutdown(&mut self) {
        info!("mixer: stopping {} channels", self.channels.len());
        for (_, decoding) in self.pending.drain() {
            decoding.abort();
        }
        self.channels.clear();
        self.bus().voices.clear();
        #[cfg(feature = "audio-output")]
        {
            self.output = None;
        }
    }
}

#[cfg(feature = "audio-output")]
mod output {
    use super::MixBus;
    use anyhow::Context;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tracing::{error, info};

    /// The default output device, before and after its stream is built.
    pub struct Output {
        device: cpal::Device,
        config: cpal::SupportedStreamConfig,
        device_lost: Arc<AtomicBool>,
        stream: Mutex<Option<cpal::Stream>>,
    }

    impl Output {
        pub fn open(device_lost: Arc<AtomicBool>) -> anyhow::Result<(Self, u32)> {
            let host = cpal::default_host();
            info!("mixer: audio host {:?}", host.id());
            let device = host
                .default_output_device()
                .context("no audio output device found")?;
            let config = device.default_output_config()?;
            let rate = config.sample_rate().0;
            Ok((
                Self {
                    device,
                    config,
                    device_lost,
                    stream: Mutex::new(None),
                },
                rate,
            ))
        }

        pub fn attach(&self, bus: Arc<Mutex<MixBus>>) -> anyhow::Result<()> {
            let stream = match self.config.sample_format() {
                cpal::SampleFormat::F32 => self.build::<f32>(bus)?,
                cpal::SampleFormat::I16 => self.build::<i16>(bus)?,
                cpal::SampleFormat::U16 => self.build::<u16>(bus)?,
                other => anyhow::bail!("unsupported sample format {:?}", other),
            };
            stream.play()?;
            info!(
                "mixer: output started at {} Hz",
                self.config.sample_rate().0
            );
            *self.stream.lock().unwrap_or_else(|p| p.into_inner()) = Some(stream);
            Ok(())
        }

        fn build<T>(&self, bus: Arc<Mutex<MixBus>>) -> anyhow::Result<cpal::Stream>
        where
            T: cpal::SizedSample + cpal::FromSample<f32>,
        {
            let channels = self.config.channels() as usize;
            let lost = self.device_lost.clone();
            let mut scratch: Vec<f32> = Vec::new();
            let stream = self.device.build_output_stream(
                &self.config.clone().into(),
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    if let Ok(mut bus) = bus.lock() {
                        bus.render(&mut scratch, channels);
                    } else {
                        scratch.fill(0.0);
                    }
                    for (dst, src) in data.iter_mut().zip(scratch.iter()) {
                        *dst = T::from_sample(*src);
                    }
                },
                move |err| {
                    error!("mixer: output stream error: {}", err);
                    lost.store(true, Ordering::Relaxed);
                },
                None,
            )?;
            Ok(stream)
        }
    }
}
