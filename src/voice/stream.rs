//! Continuous stream: forward live audio in fixed-length chunks

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::source::AudioSource;
use super::{AudioCaptureStrategy, CaptureMode, CaptureSignal, CaptureTask};

pub struct ContinuousStream {
    source: Arc<dyn AudioSource>,
    chunk: Duration,
    task: CaptureTask,
}

impl ContinuousStream {
    pub fn new(source: Arc<dyn AudioSource>, chunk: Duration) -> Self {
        Self { source, chunk, task: CaptureTask::default() }
    }

    pub fn chunk(&self) -> Duration {
        self.chunk
    }
}

impl AudioCaptureStrategy for ContinuousStream {
    fn mode(&self) -> CaptureMode {
        CaptureMode::Stream
    }

    fn start(&self, sink: mpsc::Sender<CaptureSignal>) -> bool {
        let Some((cancel, _active)) = self.task.try_begin() else {
            return false;
        };
        tokio::spawn(forward(self.source.clone(), self.chunk, sink, cancel));
        true
    }

    fn stop(&self) {
        self.task.stop();
        self.source.discard();
    }

    fn is_active(&self) -> bool {
        self.task.is_active()
    }

    fn clear(&self) {
        self.source.discard();
    }
}

async fn forward(source: Arc<dyn AudioSource>, chunk: Duration, sink: mpsc::Sender<CaptureSignal>, cancel: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + chunk, chunk);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let samples = source.drain();
                if samples.is_empty() {
                    continue;
                }
                if sink.send(CaptureSignal::Chunk(samples)).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Audio stream forwarding ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::source::ChannelSource;

    #[tokio::test(start_paused = true)]
    async fn test_forwards_chunks() {
        let source = ChannelSource::new();
        let stream = ContinuousStream::new(Arc::new(source.clone()), Duration::from_millis(40));
        let (tx, mut rx) = mpsc::channel(8);
        assert!(stream.start(tx.clone()));
        assert!(!stream.start(tx));

        source.push(&[1, 2, 3]);
        assert_eq!(rx.recv().await, Some(CaptureSignal::Chunk(vec![1, 2, 3])));
        source.push(&[4]);
        assert_eq!(rx.recv().await, Some(CaptureSignal::Chunk(vec![4])));
        stream.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_unsent_audio() {
        let source = ChannelSource::new();
        let stream = ContinuousStream::new(Arc::new(source.clone()), Duration::from_millis(40));
        let (tx, mut rx) = mpsc::channel(8);
        stream.start(tx);

        source.push(&[9; 10]);
        stream.clear();
        source.push(&[5]);
        assert_eq!(rx.recv().await, Some(CaptureSignal::Chunk(vec![5])));
        stream.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_forwarding_immediately() {
        let source = ChannelSource::new();
        let stream = ContinuousStream::new(Arc::new(source.clone()), Duration::from_millis(40));
        let (tx, mut rx) = mpsc::channel(8);
        stream.start(tx);
        stream.stop();
        source.push(&[1; 100]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert!(!stream.is_active());
    }
}
