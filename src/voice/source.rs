//! Microphone-side audio sources
//!
//! A source buffers PCM16 mono samples as they arrive (from a control
//! channel binary frame, a WAV file pump, a test) and meters their loudness
//! between polls.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Loudness floor reported for digital silence
pub const SILENCE_DB: f32 = -160.0;

/// Samples a [`ChannelSource`] holds by default (30 s at 24 kHz)
pub const DEFAULT_PENDING_CAPACITY: usize = 24_000 * 30;

/// Loudness over one metering window, in dBFS
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelReading {
    pub average_db: f32,
    pub peak_db: f32,
}

impl LevelReading {
    pub fn silence() -> Self {
        Self { average_db: SILENCE_DB, peak_db: SILENCE_DB }
    }
}

/// Where captured audio comes from
pub trait AudioSource: Send + Sync {
    /// Take every sample captured since the previous drain
    fn drain(&self) -> Vec<i16>;

    /// Throw away buffered samples without forwarding them
    fn discard(&self) {
        let _ = self.drain();
    }

    /// Loudness since the previous reading. `None` when metering is unavailable.
    fn metering(&self) -> Option<LevelReading>;
}

#[derive(Default)]
struct Meter {
    peak: i32,
    sum_squares: f64,
    count: usize,
}

impl Meter {
    fn observe(&mut self, samples: &[i16]) {
        for &s in samples {
            let s = s as i32;
            self.peak = self.peak.max(s.abs());
            self.sum_squares += (s as f64) * (s as f64);
        }
        self.count += samples.len();
    }

    fn take(&mut self) -> LevelReading {
        let meter = std::mem::take(self);
        if meter.count == 0 {
            return LevelReading::silence();
        }
        let rms = (meter.sum_squares / meter.count as f64).sqrt();
        LevelReading {
            average_db: to_dbfs(rms),
            peak_db: to_dbfs(meter.peak as f64),
        }
    }
}

/// Convert a linear PCM16 amplitude to dBFS
pub fn to_dbfs(amplitude: f64) -> f32 {
    if amplitude <= 0.0 {
        return SILENCE_DB;
    }
    ((20.0 * (amplitude / 32768.0).log10()) as f32).max(SILENCE_DB)
}

/// Loudness of a block of samples
pub fn level_of(samples: &[i16]) -> LevelReading {
    let mut meter = Meter::default();
    meter.observe(samples);
    meter.take()
}

struct ChannelState {
    pending: Vec<i16>,
    meter: Meter,
}

/// Source fed by pushing sample blocks into it.
///
/// Audio pushed while nobody drains (no recording open) is bounded: past
/// `capacity` samples the oldest are dropped.
#[derive(Clone)]
pub struct ChannelSource {
    state: Arc<Mutex<ChannelState>>,
    metered: bool,
    capacity: usize,
}

impl ChannelSource {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PENDING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState { pending: Vec::new(), meter: Meter::default() })),
            metered: true,
            capacity: capacity.max(1),
        }
    }

    /// A source whose level meter has failed
    pub fn without_metering() -> Self {
        Self { metered: false, ..Self::new() }
    }

    pub fn push(&self, samples: &[i16]) {
        if let Ok(mut state) = self.state.lock() {
            state.meter.observe(samples);
            state.pending.extend_from_slice(samples);
            let excess = state.pending.len().saturating_sub(self.capacity);
            if excess > 0 {
                state.pending.drain(..excess);
            }
        }
    }

    /// Push little-endian PCM16 bytes, as carried in binary frames
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.push(&pcm16_from_bytes(bytes));
    }

    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.pending.len()).unwrap_or(0)
    }
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSource for ChannelSource {
    fn drain(&self) -> Vec<i16> {
        self.state
            .lock()
            .map(|mut s| std::mem::take(&mut s.pending))
            .unwrap_or_default()
    }

    fn metering(&self) -> Option<LevelReading> {
        if !self.metered {
            return None;
        }
        self.state.lock().ok().map(|mut s| s.meter.take())
    }
}

/// Decode little-endian PCM16; a trailing odd byte is dropped
pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Load a mono PCM16 WAV file
pub fn load_wav(path: &Path) -> Result<(Vec<i16>, u32)> {
    let mut reader = hound::WavReader::open(path)
        .context(format!("Failed to open WAV file: {:?}", path))?;

    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        anyhow::bail!("{:?} is not PCM16", path);
    }

    let channels = spec.channels.max(1) as usize;
    let samples: Vec<i16> = reader
        .samples::<i16>()
        .filter_map(|s| s.ok())
        .step_by(channels)
        .collect();

    info!("Loaded {} samples from {:?}", samples.len(), path);
    Ok((samples, spec.sample_rate))
}

/// Save mono PCM16 samples to a WAV file
pub fn save_wav(samples: &[i16], sample_rate: u32, path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec)
        .context(format!("Failed to create WAV file: {:?}", path))?;

    for &sample in samples {
        writer.write_sample(sample)?;
    }

    writer.finalize()?;
    info!("Saved {} samples to {:?}", samples.len(), path);
    Ok(())
}

/// Feed `samples` into `source` in real time, `block` at a time, then keep
/// feeding silence for `tail` so end-of-speech can be detected.
pub async fn pump_realtime(source: ChannelSource, samples: Vec<i16>, sample_rate: u32, block: Duration, tail: Duration) {
    let per_block = ((sample_rate as u128 * block.as_millis()) / 1000).max(1) as usize;
    let mut ticker = tokio::time::interval(block);
    for chunk in samples.chunks(per_block) {
        ticker.tick().await;
        source.push(chunk);
    }
    let silence = vec![0i16; per_block];
    let tail_blocks = (tail.as_millis() / block.as_millis().max(1)) as usize;
    for _ in 0..tail_blocks {
        ticker.tick().await;
        source.push(&silence);
    }
    debug!("Audio pump finished");
}
