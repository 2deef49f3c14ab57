//! Control channel between a client app and its conversation
//!
//! JSON text frames carry commands and notifications; binary frames carry
//! PCM16 audio (microphone audio from the client, response audio to it).
//! The socket must `authenticate` before it can join a conversation.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::server::ServerState;
use crate::session::{EndReason, Notification, PlaybackSink, Session, SessionOptions};
use crate::types::MediaItem;
use crate::voice::source::pcm16_to_bytes;
use crate::voice::CaptureMode;

const DEFAULT_MEDIA_LIMIT: usize = 10;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        token: String,
    },
    JoinConversation {
        #[serde(rename = "conversationId", alias = "conversation_id")]
        conversation_id: String,
        /// Capture strategy for this conversation; server default if absent
        #[serde(default)]
        mode: Option<CaptureMode>,
    },
    LeaveConversation,
    EndConversation,
    GetCredits,
    GetRecentMedia {
        #[serde(default)]
        limit: Option<usize>,
    },
    SearchMedia {
        query: String,
    },
    /// End of the user's turn (push-to-talk release)
    Commit,
    /// Discard audio captured so far
    Clear,
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Authenticated {
        owner: String,
    },
    Joined {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        mode: CaptureMode,
    },
    Left {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Credits {
        balance: i64,
    },
    RecentMedia {
        items: Vec<MediaItem>,
    },
    MediaResults {
        query: String,
        items: Vec<MediaItem>,
    },
    /// Drop any response audio still queued for playback
    StopPlayback,
    Error {
        code: String,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error { code: code.to_string(), message: message.into() }
    }
}

/// What the writer task puts on the socket
enum Outbound {
    Message(ServerMessage),
    Notification(Notification),
    Audio(Vec<u8>),
}

/// Response audio goes straight to the socket
struct SocketPlayback {
    tx: mpsc::Sender<Outbound>,
}

impl PlaybackSink for SocketPlayback {
    fn play(&self, samples: Vec<i16>) {
        if self.tx.try_send(Outbound::Audio(pcm16_to_bytes(&samples))).is_err() {
            warn!("Control socket backed up; dropping {} samples of response audio", samples.len());
        }
    }

    fn stop(&self) {
        let _ = self.tx.try_send(Outbound::Message(ServerMessage::StopPlayback));
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(|socket| handle_control(socket, state))
}

async fn handle_control(ws: WebSocket, state: ServerState) {
    info!("Control channel connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(256);

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match msg {
                Outbound::Message(m) => serde_json::to_string(&m).map(|s| Message::Text(s.into())),
                Outbound::Notification(n) => serde_json::to_string(&n).map(|s| Message::Text(s.into())),
                Outbound::Audio(pcm) => Ok(Message::Binary(pcm.into())),
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode control message: {}", e);
                    continue;
                }
            };
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ControlConnection::new(state, tx);
    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(message) => conn.handle(message).await,
                Err(e) => {
                    debug!("Unparseable control message: {}", e);
                    conn.reply(ServerMessage::error("bad_request", e.to_string())).await;
                }
            },
            Message::Binary(data) => conn.audio(&data),
            Message::Close(_) => break,
            _ => {}
        }
    }

    conn.leave().await;
    drop(conn);
    let _ = sender_task.await;
    info!("Control channel disconnected");
}

/// Per-socket state
struct ControlConnection {
    state: ServerState,
    tx: mpsc::Sender<Outbound>,
    owner: Option<String>,
    session: Option<Arc<Session>>,
    forwarder: Option<JoinHandle<()>>,
}

impl ControlConnection {
    fn new(state: ServerState, tx: mpsc::Sender<Outbound>) -> Self {
        Self { state, tx, owner: None, session: None, forwarder: None }
    }

    async fn reply(&self, message: ServerMessage) {
        let _ = self.tx.send(Outbound::Message(message)).await;
    }

    fn audio(&self, data: &[u8]) {
        match &self.session {
            Some(session) => session.push_audio(data),
            None => debug!("Dropping {} bytes of audio outside a conversation", data.len()),
        }
    }

    async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Authenticate { token } => match self.state.auth_state.authenticate(&token) {
                Ok(owner) => {
                    info!("Control channel authenticated as {}", owner);
                    self.owner = Some(owner.clone());
                    self.reply(ServerMessage::Authenticated { owner }).await;
                }
                Err(e) => self.reply(ServerMessage::error("unauthorized", e.to_string())).await,
            },
            ClientMessage::Ping => self.reply(ServerMessage::Pong).await,
            ClientMessage::GetCredits => self.credits().await,
            other => {
                if self.owner.is_none() {
                    self.reply(ServerMessage::error("unauthorized", "authenticate first")).await;
                    return;
                }
                self.handle_authenticated(other).await;
            }
        }
    }

    async fn handle_authenticated(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::JoinConversation { conversation_id, mode } => self.join(conversation_id, mode).await,
            ClientMessage::LeaveConversation | ClientMessage::EndConversation => {
                if let Some(id) = self.leave().await {
                    self.reply(ServerMessage::Left { conversation_id: id }).await;
                }
            }
            ClientMessage::GetRecentMedia { limit } => {
                let Some(session) = self.joined().await else { return };
                let items = session.recent_media(limit.unwrap_or(DEFAULT_MEDIA_LIMIT));
                self.reply(ServerMessage::RecentMedia { items }).await;
            }
            ClientMessage::SearchMedia { query } => {
                let Some(session) = self.joined().await else { return };
                let items = session.search_media(&query);
                self.reply(ServerMessage::MediaResults { query, items }).await;
            }
            ClientMessage::Commit => {
                if let Some(session) = self.joined().await {
                    session.commit().await;
                }
            }
            ClientMessage::Clear => {
                if let Some(session) = self.joined().await {
                    session.clear().await;
                }
            }
            ClientMessage::Authenticate { .. } | ClientMessage::Ping | ClientMessage::GetCredits => {}
        }
    }

    async fn joined(&self) -> Option<Arc<Session>> {
        match &self.session {
            Some(session) if !session.is_ended() => Some(session.clone()),
            _ => {
                self.reply(ServerMessage::error("not_joined", "join a conversation first")).await;
                None
            }
        }
    }

    async fn join(&mut self, conversation_id: String, mode: Option<CaptureMode>) {
        let Some(owner) = self.owner.clone() else { return };
        if conversation_id.trim().is_empty() {
            self.reply(ServerMessage::error("bad_request", "conversationId is required")).await;
            return;
        }
        if let Some(previous) = self.leave().await {
            self.reply(ServerMessage::Left { conversation_id: previous }).await;
        }

        let mut options = SessionOptions::new(&conversation_id, &owner)
            .with_playback(Arc::new(SocketPlayback { tx: self.tx.clone() }));
        if let Some(mode) = mode {
            options = options.with_mode(mode);
        }
        let session = match self.state.sessions.start(options).await {
            Ok(session) => session,
            Err(e) => {
                warn!("{} refused {}: {}", owner, conversation_id, e);
                self.reply(ServerMessage::error("forbidden", e.to_string())).await;
                return;
            }
        };
        self.forwarder = Some(forward_notifications(session.subscribe(), self.tx.clone()));
        info!("{} joined {} ({})", owner, conversation_id, session.mode());
        self.reply(ServerMessage::Joined { conversation_id, mode: session.mode() }).await;
        self.session = Some(session);
    }

    /// End the joined conversation, if any. Returns its id.
    async fn leave(&mut self) -> Option<String> {
        let session = self.session.take()?;
        session.shutdown(EndReason::Stopped);
        // Let the runner publish its final notifications before detaching
        session.wait().await;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        Some(session.id().to_string())
    }

    async fn credits(&self) {
        let Some(owner) = &self.owner else {
            self.reply(ServerMessage::error("unauthorized", "authenticate first")).await;
            return;
        };
        let balance = match &self.session {
            Some(session) => session.credits_balance().await,
            None => self.state.sessions.ledger().balance(owner).await,
        };
        match balance {
            Ok(balance) => self.reply(ServerMessage::Credits { balance }).await,
            Err(e) => self.reply(ServerMessage::error("credits_unavailable", e.to_string())).await,
        }
    }
}

fn forward_notifications(mut rx: broadcast::Receiver<Notification>, tx: mpsc::Sender<Outbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let ended = matches!(notification, Notification::Ended { .. });
                    if tx.send(Outbound::Notification(notification)).await.is_err() || ended {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => warn!("Control socket lagged; {} notifications skipped", n),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
