//! Audio capture strategies
//!
//! Two ways of turning microphone audio into model input, behind one trait:
//!
//! - [`buffered::UtteranceBuffering`]: records, detects end of speech
//!   locally and emits one [`Utterance`] per turn. Half duplex.
//! - [`stream::ContinuousStream`]: forwards fixed-length chunks and leaves
//!   speech boundaries to the model. Full duplex.
//!
//! Neither strategy decides *when* to capture; the turn state machine does.

pub mod buffered;
pub mod source;
pub mod stream;
pub mod vad;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use crate::config::CaptureMode;
use crate::config::Config;
pub use buffered::UtteranceBuffering;
pub use source::{AudioSource, ChannelSource, LevelReading};
pub use stream::ContinuousStream;
pub use vad::{CloseReason, EndOfSpeechDetector, VadConfig};

/// One bounded span of captured speech, consumed exactly once
#[derive(Debug, PartialEq)]
pub struct Utterance {
    /// PCM16 mono samples
    pub samples: Vec<i16>,
    /// Loudness per poll (empty when metering was unavailable)
    pub trace: Vec<LevelReading>,
    /// Recording time when the utterance closed
    pub duration: Duration,
    pub reason: CloseReason,
}

impl Utterance {
    pub fn peak_db(&self) -> Option<f32> {
        self.trace.iter().map(|r| r.peak_db).reduce(f32::max)
    }
}

/// What a capture strategy hands to the session
#[derive(Debug, PartialEq)]
pub enum CaptureSignal {
    /// A closed utterance (buffered)
    Utterance(Utterance),
    /// A recording closed without any detected speech (buffered)
    NoSpeech,
    /// A block of live audio (stream)
    Chunk(Vec<i16>),
}

pub trait AudioCaptureStrategy: Send + Sync {
    fn mode(&self) -> CaptureMode;

    /// Whether capture may overlap playback
    fn full_duplex(&self) -> bool {
        self.mode() == CaptureMode::Stream
    }

    /// Begin capturing into `sink`. Returns `false` without side effects when
    /// capture is already active.
    fn start(&self, sink: mpsc::Sender<CaptureSignal>) -> bool;

    /// Stop capturing. Pending audio is dropped and the timer task ends.
    fn stop(&self);

    fn is_active(&self) -> bool;

    /// Discard captured audio that has not been handed on yet
    fn clear(&self);
}

/// Build the strategy for `mode` reading from `source`
pub fn strategy_for(mode: CaptureMode, source: Arc<dyn AudioSource>, config: &Config) -> Arc<dyn AudioCaptureStrategy> {
    match mode {
        CaptureMode::Buffered => Arc::new(UtteranceBuffering::new(source, VadConfig::from(&config.capture))),
        CaptureMode::Stream => Arc::new(ContinuousStream::new(
            source,
            Duration::from_millis(config.realtime.chunk_ms.max(10)),
        )),
    }
}

/// Shared start/stop bookkeeping for the capture task of a strategy
#[derive(Default)]
pub(crate) struct CaptureTask {
    active: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl CaptureTask {
    /// Claim the task slot. `None` if a capture is already running.
    pub(crate) fn try_begin(&self) -> Option<(CancellationToken, Arc<AtomicBool>)> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let token = CancellationToken::new();
        if let Ok(mut cancel) = self.cancel.lock() {
            if let Some(old) = cancel.replace(token.clone()) {
                old.cancel();
            }
        }
        Some((token, self.active.clone()))
    }

    pub(crate) fn stop(&self) {
        if let Ok(mut cancel) = self.cancel.lock() {
            if let Some(token) = cancel.take() {
                token.cancel();
            }
        }
        self.active.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for CaptureTask {
    fn drop(&mut self) {
        self.stop();
    }
}
