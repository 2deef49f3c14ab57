//! Utterance buffering: record, detect end of speech, hand off one utterance

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::source::AudioSource;
use super::vad::{CloseReason, EndOfSpeechDetector, VadConfig, VadDecision};
use super::{AudioCaptureStrategy, CaptureMode, CaptureSignal, CaptureTask, Utterance};

pub struct UtteranceBuffering {
    source: Arc<dyn AudioSource>,
    config: VadConfig,
    task: CaptureTask,
}

impl UtteranceBuffering {
    pub fn new(source: Arc<dyn AudioSource>, config: VadConfig) -> Self {
        Self { source, config, task: CaptureTask::default() }
    }
}

impl AudioCaptureStrategy for UtteranceBuffering {
    fn mode(&self) -> CaptureMode {
        CaptureMode::Buffered
    }

    fn start(&self, sink: mpsc::Sender<CaptureSignal>) -> bool {
        let Some((cancel, active)) = self.task.try_begin() else {
            debug!("Recording already open; ignoring start");
            return false;
        };
        // Audio from before the listening phase is not part of this turn
        self.source.discard();
        let _ = self.source.metering();
        tokio::spawn(record(self.source.clone(), self.config, sink, cancel, active));
        true
    }

    fn stop(&self) {
        if self.task.is_active() {
            debug!("Recording stopped early");
        }
        self.task.stop();
    }

    fn is_active(&self) -> bool {
        self.task.is_active()
    }

    fn clear(&self) {
        self.source.discard();
    }
}

/// Poll loop for one recording. Dropping out of the loop drops the timer.
async fn record(
    source: Arc<dyn AudioSource>,
    config: VadConfig,
    sink: mpsc::Sender<CaptureSignal>,
    cancel: CancellationToken,
    active: Arc<AtomicBool>,
) {
    let started = Instant::now();
    let mut ticker = interval_at(started + config.poll_interval, config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut detector = EndOfSpeechDetector::new(config);
    let mut samples: Vec<i16> = Vec::new();

    let (reason, duration) = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Recording cancelled after {:?}", started.elapsed());
                return;
            }
            now = ticker.tick() => {
                samples.extend(source.drain());
                let elapsed = now.duration_since(started);
                if let VadDecision::Close(reason) = detector.observe(elapsed, source.metering()) {
                    break (reason, elapsed);
                }
            }
        }
    };

    drop(ticker);
    // A stopped recording no longer owns the active flag
    if cancel.is_cancelled() {
        return;
    }
    active.store(false, Ordering::SeqCst);

    // Without metering there is no way to tell silence from speech
    let signal = if detector.speech_started() || reason == CloseReason::MeteringUnavailable {
        info!("Utterance closed ({:?}) after {:?}, {} samples", reason, duration, samples.len());
        CaptureSignal::Utterance(Utterance {
            samples,
            trace: detector.into_trace(),
            duration,
            reason,
        })
    } else {
        debug!("No speech in {:?}; discarding recording", duration);
        CaptureSignal::NoSpeech
    };

    if sink.send(signal).await.is_err() {
        warn!("Capture sink closed; utterance dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::source::{ChannelSource, LevelReading};
    use std::time::Duration;

    /// Loud until `loud_for`, silent afterwards, measured from creation
    struct ScriptedSource {
        created: Instant,
        loud_for: Duration,
        metered: bool,
    }

    impl AudioSource for ScriptedSource {
        fn drain(&self) -> Vec<i16> {
            vec![100; 2400]
        }

        fn metering(&self) -> Option<LevelReading> {
            if !self.metered {
                return None;
            }
            let db = if self.created.elapsed() <= self.loud_for { -20.0 } else { -80.0 };
            Some(LevelReading { average_db: db, peak_db: db })
        }
    }

    fn scripted(loud_ms: u64, metered: bool) -> Arc<dyn AudioSource> {
        Arc::new(ScriptedSource {
            created: Instant::now(),
            loud_for: Duration::from_millis(loud_ms),
            metered,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_closes_at_2600_after_2000_of_speech() {
        let capture = UtteranceBuffering::new(scripted(2000, true), VadConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        let t0 = Instant::now();
        assert!(capture.start(tx));

        let signal = rx.recv().await.unwrap();
        assert_eq!(t0.elapsed(), Duration::from_millis(2600));
        match signal {
            CaptureSignal::Utterance(u) => {
                assert_eq!(u.reason, CloseReason::EndOfSpeech);
                assert_eq!(u.duration, Duration::from_millis(2600));
                assert_eq!(u.trace.len(), 26);
                assert_eq!(u.samples.len(), 26 * 2400);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!capture.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let capture = UtteranceBuffering::new(scripted(2000, true), VadConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        assert!(capture.start(tx.clone()));
        assert!(!capture.start(tx));

        assert!(matches!(rx.recv().await, Some(CaptureSignal::Utterance(_))));
        // Exactly one utterance for the one recording
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer_and_drops_audio() {
        let capture = UtteranceBuffering::new(scripted(60_000, true), VadConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        assert!(capture.start(tx));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        capture.stop();
        assert!(!capture.is_active());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metering_failure_closes_at_fallback() {
        let capture = UtteranceBuffering::new(scripted(0, false), VadConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        let t0 = Instant::now();
        capture.start(tx);

        match rx.recv().await.unwrap() {
            CaptureSignal::Utterance(u) => {
                assert_eq!(u.reason, CloseReason::MeteringUnavailable);
                assert!(u.trace.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(t0.elapsed(), Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_recording_is_discarded_at_cap() {
        let config = VadConfig { max_utterance: Duration::from_secs(3), ..VadConfig::default() };
        let capture = UtteranceBuffering::new(Arc::new(ChannelSource::new()), config);
        let (tx, mut rx) = mpsc::channel(4);
        capture.start(tx);
        assert_eq!(rx.recv().await, Some(CaptureSignal::NoSpeech));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_close() {
        let capture = UtteranceBuffering::new(scripted(1000, true), VadConfig::default());
        let (tx, mut rx) = mpsc::channel(4);
        capture.start(tx.clone());
        rx.recv().await.unwrap();
        assert!(capture.start(tx));
        assert!(capture.is_active());
        capture.stop();
    }
}
