//! End-of-speech detection for utterance buffering
//!
//! Pure decision logic, driven by one loudness reading per poll:
//!
//! ```text
//! reading → rolling window (3) → speech started?
//!                                     ↓ yes
//!                     silence since last loud sample ≥ required(elapsed)?
//!                                     ↓ yes (and elapsed ≥ floor)
//!                                end of speech
//! ```
//!
//! The required silence grows with the utterance so long turns tolerate
//! natural pauses. Without metering the utterance closes on a fixed timer.

use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, trace};

use super::source::LevelReading;
use crate::config::CaptureConfig;

/// Readings in the rolling window
pub const WINDOW_LEN: usize = 3;

/// Detector settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// Interval between loudness readings
    pub poll_interval: Duration,
    /// Speech threshold in dBFS
    pub threshold_db: f32,
    /// No decision before this much recording
    pub min_recording: Duration,
    /// Close time when metering is unavailable
    pub fallback_timeout: Duration,
    /// Hard cap on one utterance
    pub max_utterance: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for VadConfig {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            threshold_db: config.speech_threshold_db,
            min_recording: Duration::from_millis(config.min_recording_ms),
            fallback_timeout: Duration::from_millis(config.fallback_timeout_ms),
            max_utterance: Duration::from_millis(config.max_utterance_ms),
        }
    }
}

/// Silence needed to close an utterance that has been recording for `elapsed`
pub fn required_silence(elapsed: Duration) -> Duration {
    match elapsed.as_millis() {
        0..=2999 => Duration::from_millis(600),
        3000..=5999 => Duration::from_millis(700),
        _ => Duration::from_millis(800),
    }
}

/// Why an utterance was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Enough trailing silence after speech
    EndOfSpeech,
    /// Metering unavailable; fixed timer expired
    MeteringUnavailable,
    /// Hard maximum length reached
    MaxDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Continue,
    Close(CloseReason),
}

/// Per-utterance detector state
#[derive(Debug)]
pub struct EndOfSpeechDetector {
    config: VadConfig,
    window: VecDeque<f32>,
    speech_started: bool,
    last_loud: Option<Duration>,
    metering_lost: bool,
    trace: Vec<LevelReading>,
}

impl EndOfSpeechDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            window: VecDeque::with_capacity(WINDOW_LEN),
            speech_started: false,
            last_loud: None,
            metering_lost: false,
            trace: Vec::new(),
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn speech_started(&self) -> bool {
        self.speech_started
    }

    /// Whether metering has failed at any point during this utterance
    pub fn metering_lost(&self) -> bool {
        self.metering_lost
    }

    /// Loudness trace, one entry per metered poll
    pub fn trace(&self) -> &[LevelReading] {
        &self.trace
    }

    pub fn into_trace(self) -> Vec<LevelReading> {
        self.trace
    }

    /// Feed the reading taken `elapsed` after recording started
    pub fn observe(&mut self, elapsed: Duration, reading: Option<LevelReading>) -> VadDecision {
        if elapsed >= self.config.max_utterance {
            debug!("Utterance hit the {:?} cap", self.config.max_utterance);
            return VadDecision::Close(CloseReason::MaxDuration);
        }

        let reading = match reading {
            Some(r) if !self.metering_lost => r,
            _ => {
                if !self.metering_lost {
                    debug!("Metering unavailable; closing at {:?}", self.config.fallback_timeout);
                    self.metering_lost = true;
                }
                return if elapsed >= self.config.fallback_timeout {
                    VadDecision::Close(CloseReason::MeteringUnavailable)
                } else {
                    VadDecision::Continue
                };
            }
        };

        self.trace.push(reading);
        let level = reading.average_db;

        if self.window.len() == WINDOW_LEN {
            self.window.pop_front();
        }
        self.window.push_back(level);

        if level > self.config.threshold_db {
            self.last_loud = Some(elapsed);
        }

        if !self.speech_started {
            let rolling = self.window.iter().sum::<f32>() / self.window.len() as f32;
            if rolling > self.config.threshold_db {
                debug!("Speech started at {:?} ({:.1} dB)", elapsed, rolling);
                self.speech_started = true;
                // The onset itself counts as sound even if this sample dipped
                self.last_loud.get_or_insert(elapsed);
            }
        }

        trace!("VAD {:?}: level={:.1}dB started={}", elapsed, level, self.speech_started);

        if elapsed < self.config.min_recording || !self.speech_started {
            return VadDecision::Continue;
        }

        let last_loud = self.last_loud.unwrap_or_default();
        let silence = elapsed.saturating_sub(last_loud);
        if silence >= required_silence(elapsed) {
            debug!("End of speech at {:?} after {:?} of silence", elapsed, silence);
            VadDecision::Close(CloseReason::EndOfSpeech)
        } else {
            VadDecision::Continue
        }
    }
}
