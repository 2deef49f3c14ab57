//! In-memory transport for exercising sessions without a model
//!
//! Every `connect()` hands the far end of the new channel to the test as a
//! [`RemoteEnd`], which plays the model: it reads what the session sent and
//! emits normalized inbound events.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::{InboundEvent, OutboundEvent};
use super::transport::{Connection, Connector};
use crate::error::TransportError;

pub struct LoopbackConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    failures: Mutex<VecDeque<TransportError>>,
}

impl LoopbackConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { remotes: tx, failures: Mutex::new(VecDeque::new()) }), rx)
    }

    /// Make the next `connect()` fail with `err`
    pub fn fail_next(&self, err: TransportError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(err);
        }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        if let Some(err) = self.failures.lock().ok().and_then(|mut f| f.pop_front()) {
            return Err(err);
        }
        let (out_tx, out_rx) = mpsc::channel(256);
        let (in_tx, in_rx) = mpsc::channel(256);
        let closer = CancellationToken::new();
        let remote = RemoteEnd { sent: out_rx, events: in_tx, closer: closer.clone() };
        self.remotes
            .send(remote)
            .map_err(|_| TransportError::Connect("loopback peer gone".into()))?;
        Ok(Connection { outbound: out_tx, inbound: in_rx, closer })
    }
}

/// The model's side of one loopback connection
pub struct RemoteEnd {
    sent: mpsc::Receiver<OutboundEvent>,
    events: mpsc::Sender<Result<InboundEvent, TransportError>>,
    closer: CancellationToken,
}

impl RemoteEnd {
    /// Deliver an event to the session
    pub async fn emit(&self, event: InboundEvent) {
        let _ = self.events.send(Ok(event)).await;
    }

    /// Next event the session sent, or `None` once the session side is gone
    pub async fn next_sent(&mut self) -> Option<OutboundEvent> {
        tokio::select! {
            ev = self.sent.recv() => ev,
            _ = self.closer.cancelled() => self.sent.try_recv().ok(),
        }
    }

    /// Like [`next_sent`](Self::next_sent) but gives up after `timeout`
    pub async fn next_sent_within(&mut self, timeout: Duration) -> Option<OutboundEvent> {
        tokio::time::timeout(timeout, self.next_sent()).await.ok().flatten()
    }

    pub fn try_next_sent(&mut self) -> Option<OutboundEvent> {
        self.sent.try_recv().ok()
    }

    /// Stop accepting frames while keeping the inbound side open, so the
    /// session's next send fails
    pub fn stop_reading(&mut self) {
        self.sent.close();
    }

    /// Whether the session tore this connection down
    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.events.is_closed()
    }

    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closer.cancelled() => {}
            _ = self.events.closed() => {}
        }
    }

    /// Drop the channel from the model's side
    pub async fn disconnect(self, reason: &str) {
        let _ = self.events.send(Err(TransportError::Closed(reason.to_string()))).await;
        self.closer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_pairs_connections() {
        let (connector, mut remotes) = LoopbackConnector::new();
        let mut conn = connector.connect().await.unwrap();
        let mut remote = remotes.recv().await.unwrap();

        conn.outbound.send(OutboundEvent::Commit).await.unwrap();
        assert_eq!(remote.next_sent().await, Some(OutboundEvent::Commit));

        remote.emit(InboundEvent::ResponseDone).await;
        assert_eq!(conn.inbound.recv().await.unwrap().unwrap(), InboundEvent::ResponseDone);

        conn.closer.cancel();
        assert!(remote.is_closed());
    }

    #[tokio::test]
    async fn test_fail_next_once() {
        let (connector, _remotes) = LoopbackConnector::new();
        connector.fail_next(TransportError::Connect("refused".into()));
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
    }
}
