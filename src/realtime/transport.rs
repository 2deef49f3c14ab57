//! Transport session: the duplex channel to the speech model
//!
//! ```text
//!   runner ──OutboundEvent──→ mpsc ──→ writer task ──frames──→ model
//!   runner ←─InboundEvent──── mpsc ←── reader task ←─frames─── model
//! ```
//!
//! All outbound frames for one connection go through a single writer task.
//! A connection is never reused after a failure: [`TransportSession::connect`]
//! always tears the old link down and opens a fresh one.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dialect::{self, Dialect};
use super::events::{InboundEvent, OutboundEvent};
use crate::config::RealtimeConfig;
use crate::error::{AuthError, ProtocolError, TransportError};
use crate::tools::ToolDefinition;

/// Queue depth between the session and the socket tasks
const QUEUE_DEPTH: usize = 256;

/// One open channel to the model
pub struct Connection {
    /// Single-writer queue
    pub outbound: mpsc::Sender<OutboundEvent>,
    /// Normalized inbound events; an `Err` is the last item before the channel ends
    pub inbound: mpsc::Receiver<Result<InboundEvent, TransportError>>,
    /// Cancelling stops both socket tasks
    pub closer: CancellationToken,
}

/// Opens connections to the model
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;
}

/// WebSocket connector for the configured endpoint and dialect
pub struct WsConnector {
    endpoint: String,
    api_key: Option<String>,
    dialect: Dialect,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(config: &RealtimeConfig, api_key: Option<String>) -> Self {
        // An unparsable endpoint is reported by the first connect
        let endpoint = config
            .endpoint_url()
            .map(|url| url.to_string())
            .unwrap_or_else(|_| config.endpoint.clone());
        Self {
            endpoint,
            api_key,
            dialect: config.dialect,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
        }
    }

    fn request(&self) -> Result<tungstenite::handshake::client::Request, TransportError> {
        let mut req = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("bad endpoint {}: {}", self.endpoint, e)))?;

        match (&self.api_key, self.dialect) {
            (Some(key), _) => {
                let bearer = HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|_| AuthError::Rejected("API key is not a valid header value".into()))?;
                let headers = req.headers_mut();
                headers.insert("Authorization", bearer);
                if self.dialect == Dialect::Openai {
                    headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
                }
            }
            (None, Dialect::Openai) => return Err(AuthError::MissingCredentials.into()),
            (None, Dialect::Relay) => {}
        }
        Ok(req)
    }
}

/// Map a handshake failure to the right error class
fn classify_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
            AuthError::Rejected(format!("HTTP {}", resp.status())).into()
        }
        other => TransportError::Connect(other.to_string()),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let req = self.request()?;
        info!("Connecting to {}", self.endpoint);

        let (ws, _resp) = match tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(req)).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(classify_connect_error(e)),
            Err(_) => return Err(TransportError::Connect(format!("timed out after {:?}", self.connect_timeout))),
        };

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<OutboundEvent>(QUEUE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(QUEUE_DEPTH);
        let closer = CancellationToken::new();
        let dialect = self.dialect;

        // Writer: the only task that touches the socket sink
        let writer_closer = closer.clone();
        tokio::spawn(async move {
            'outer: loop {
                let event = tokio::select! {
                    _ = writer_closer.cancelled() => break,
                    event = out_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let frames = match dialect::encode(dialect, &event) {
                    Ok(frames) => frames,
                    Err(e) => {
                        error!("Failed to encode outbound event: {}", e);
                        continue;
                    }
                };
                for frame in frames {
                    if let Err(e) = ws_tx.send(WsMessage::Text(frame.into())).await {
                        warn!("Transport write failed: {}", e);
                        writer_closer.cancel();
                        break 'outer;
                    }
                }
            }
            let _ = ws_tx.close().await;
            debug!("Transport writer stopped");
        });

        let reader_closer = closer.clone();
        tokio::spawn(async move {
            let failure = loop {
                let msg = tokio::select! {
                    _ = reader_closer.cancelled() => break TransportError::Closed("closed locally".into()),
                    msg = ws_rx.next() => msg,
                };
                match msg {
                    Some(Ok(WsMessage::Text(text))) => match dialect::decode(dialect, text.as_str()) {
                        Ok(Some(event)) => {
                            if in_tx.send(Ok(event)).await.is_err() {
                                break TransportError::Closed("session dropped".into());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Dropping inbound frame: {}", e),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_else(|| "no reason".into());
                        break TransportError::Closed(format!("remote closed: {}", reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportError::Closed(e.to_string()),
                    None => break TransportError::Closed("end of stream".into()),
                }
            };
            reader_closer.cancel();
            let _ = in_tx.send(Err(failure)).await;
            debug!("Transport reader stopped");
        });

        Ok(Connection { outbound: out_tx, inbound: in_rx, closer })
    }
}

/// What the model is told when a connection is configured
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub instructions: String,
    pub voice: String,
    pub tools: Vec<ToolDefinition>,
    /// Let the model detect speech boundaries (continuous stream)
    pub server_vad: bool,
}

struct Link {
    outbound: mpsc::Sender<OutboundEvent>,
    inbound: mpsc::Receiver<Result<InboundEvent, TransportError>>,
    closer: CancellationToken,
    ready: bool,
    configured: bool,
    resume: Option<String>,
}

/// Lifecycle of the model connection for one conversation
pub struct TransportSession {
    connector: Arc<dyn Connector>,
    settings: SessionSettings,
    link: Option<Link>,
    connections: u64,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn Connector>, settings: SessionSettings) -> Self {
        Self { connector, settings, link: None, connections: 0 }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_configured(&self) -> bool {
        self.link.as_ref().map(|l| l.configured).unwrap_or(false)
    }

    /// Connections opened over the lifetime of this session
    pub fn connections(&self) -> u64 {
        self.connections
    }

    /// Open a fresh connection, tearing down any existing one first.
    ///
    /// `resume` is a transcript digest appended to the instructions when
    /// this connection is configured.
    pub async fn connect(&mut self, resume: Option<String>) -> Result<(), TransportError> {
        self.close();
        let conn = self.connector.connect().await?;
        self.connections += 1;
        info!("Transport connected (connection #{})", self.connections);
        self.link = Some(Link {
            outbound: conn.outbound,
            inbound: conn.inbound,
            closer: conn.closer,
            ready: false,
            configured: false,
            resume,
        });
        Ok(())
    }

    /// Next normalized event. Pending forever while disconnected.
    pub async fn next_event(&mut self) -> Result<InboundEvent, TransportError> {
        let Some(link) = self.link.as_mut() else {
            return std::future::pending().await;
        };
        match link.inbound.recv().await {
            Some(Ok(event)) => {
                if event == InboundEvent::SessionCreated {
                    link.ready = true;
                }
                Ok(event)
            }
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Closed("channel ended".into())),
        }
    }

    /// Send the session configuration for this connection.
    ///
    /// Returns `Ok(false)` without sending when the channel is not ready yet
    /// or the configuration was already sent.
    pub async fn configure(&mut self) -> Result<bool, TransportError> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TransportError::Closed("not connected".into()))?;

        if link.configured {
            warn!("Protocol violation: {}", ProtocolError::DuplicateConfiguration);
            return Ok(false);
        }
        if !link.ready {
            warn!("Refusing to configure before the channel reports ready");
            return Ok(false);
        }

        let mut instructions = self.settings.instructions.clone();
        if let Some(digest) = link.resume.take().filter(|d| !d.is_empty()) {
            instructions.push_str("\n\nThe connection was interrupted. Conversation so far:\n");
            instructions.push_str(&digest);
        }

        let update = OutboundEvent::SessionUpdate {
            instructions,
            voice: self.settings.voice.clone(),
            tools: self.settings.tools.clone(),
            server_vad: self.settings.server_vad,
        };
        link.outbound
            .send(update)
            .await
            .map_err(|_| TransportError::Closed("writer stopped".into()))?;
        link.configured = true;
        debug!("Session configuration sent ({} tools)", self.settings.tools.len());
        Ok(true)
    }

    /// Queue an event for the writer task.
    ///
    /// Nothing but the configuration may go out before the connection is
    /// configured; such frames are refused with [`TransportError::NotConfigured`].
    pub async fn send(&self, event: OutboundEvent) -> Result<(), TransportError> {
        if matches!(event, OutboundEvent::SessionUpdate { .. }) {
            warn!("Protocol violation: session.update must go through configure()");
            return Ok(());
        }
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| TransportError::Closed("not connected".into()))?;
        if !self.is_configured() {
            return Err(TransportError::NotConfigured);
        }
        link.outbound
            .send(event)
            .await
            .map_err(|_| TransportError::Closed("writer stopped".into()))
    }

    /// Tear the connection down. Queued frames are dropped. Returns whether
    /// a connection was open.
    pub fn close(&mut self) -> bool {
        match self.link.take() {
            Some(link) => {
                link.closer.cancel();
                info!("Transport closed");
                true
            }
            None => false,
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}
