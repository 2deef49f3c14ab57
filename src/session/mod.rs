//! Conversation sessions
//!
//! A [`Session`] is the handle the outside world holds for one live
//! conversation: it accepts microphone audio and control commands and
//! publishes [`Notification`]s. The work itself happens in a
//! [`runner::SessionRunner`] task that owns the transport, the turn state
//! machine, the capture strategy and the tool bridge.

pub mod registry;
pub mod runner;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::credits::{CreditContext, CreditLedger};
use crate::error::{LedgerError, SessionError};
use crate::realtime::{Connector, Phase, SessionSettings, TransportSession, TurnStateMachine};
use crate::tools::{ToolInvocationBridge, ToolRegistry};
use crate::types::{ConversationId, ConversationTurn, MediaItem, OwnerId};
use crate::voice::{self, AudioSource, CaptureMode, ChannelSource};

pub use registry::{SessionRegistry, SessionSummary};
pub use runner::{RunnerConfig, SessionRunner};

/// Control requests from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// The user finished talking (stream mode)
    Commit,
    /// Drop audio captured so far
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Closed on request
    Stopped,
    /// Another session took over the conversation id
    Replaced,
    IdleTimeout,
    /// Reconnect attempts exhausted
    TransportFailed,
    AuthFailed,
}

/// Everything a UI needs to follow the conversation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Phase { phase: Phase },
    Transcript { turn: ConversationTurn },
    ToolUpdate {
        call_id: String,
        tool: String,
        status: ToolStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        credits_charged: u64,
    },
    Credits { balance: i64 },
    Error { code: String, message: String },
    Ended { reason: EndReason },
}

impl Notification {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Notification::Error { code: code.to_string(), message: message.into() }
    }
}

/// Where response audio goes
pub trait PlaybackSink: Send + Sync {
    fn play(&self, samples: Vec<i16>);
    /// Cut playback short, dropping anything queued
    fn stop(&self);
}

/// Discards all audio
pub struct NullPlayback;

impl PlaybackSink for NullPlayback {
    fn play(&self, _samples: Vec<i16>) {}
    fn stop(&self) {}
}

/// Collects response audio in memory, e.g. to write it to a WAV file
#[derive(Default)]
pub struct RecordingPlayback {
    samples: Mutex<Vec<i16>>,
    stops: Mutex<usize>,
}

impl RecordingPlayback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<i16> {
        self.samples.lock().map(|mut s| std::mem::take(&mut *s)).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times playback was cut short
    pub fn stops(&self) -> usize {
        self.stops.lock().map(|s| *s).unwrap_or(0)
    }
}

impl PlaybackSink for RecordingPlayback {
    fn play(&self, samples: Vec<i16>) {
        if let Ok(mut buf) = self.samples.lock() {
            buf.extend_from_slice(&samples);
        }
    }

    fn stop(&self) {
        if let Ok(mut stops) = self.stops.lock() {
            *stops += 1;
        }
    }
}

/// Handle to one live conversation
pub struct Session {
    id: ConversationId,
    owner: OwnerId,
    instance: uuid::Uuid,
    mode: CaptureMode,
    created_at: DateTime<Utc>,
    phase: watch::Receiver<Phase>,
    commands: mpsc::Sender<SessionCommand>,
    notifications: broadcast::Sender<Notification>,
    audio_in: ChannelSource,
    tools: Arc<ToolRegistry>,
    credits: Arc<CreditContext>,
    media: Mutex<VecDeque<MediaItem>>,
    media_capacity: usize,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    stop_reason: Mutex<Option<EndReason>>,
    ended: watch::Sender<Option<EndReason>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("instance", &self.instance)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build the handle. The caller owns the returned command receiver and
    /// is expected to drive the session with it.
    pub(crate) fn new(
        id: &str,
        mode: CaptureMode,
        phase: watch::Receiver<Phase>,
        audio_in: ChannelSource,
        tools: Arc<ToolRegistry>,
        credits: Arc<CreditContext>,
        media_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<SessionCommand>) {
        let (commands, commands_rx) = mpsc::channel(32);
        let (notifications, _) = broadcast::channel(256);
        let (ended, _) = watch::channel(None);
        let session = Arc::new(Self {
            id: id.to_string(),
            owner: credits.owner().to_string(),
            instance: uuid::Uuid::new_v4(),
            mode,
            created_at: Utc::now(),
            phase,
            commands,
            notifications,
            audio_in,
            tools,
            credits,
            media: Mutex::new(VecDeque::new()),
            media_capacity: media_capacity.max(1),
            last_activity: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
            stop_reason: Mutex::new(None),
            ended,
        });
        (session, commands_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Distinguishes sessions that reused a conversation id
    pub fn instance(&self) -> uuid::Uuid {
        self.instance
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn credits(&self) -> &Arc<CreditContext> {
        &self.credits
    }

    /// Feed little-endian PCM16 microphone audio
    pub fn push_audio(&self, bytes: &[u8]) {
        self.audio_in.push_bytes(bytes);
        self.touch();
    }

    pub fn push_samples(&self, samples: &[i16]) {
        self.audio_in.push(samples);
        self.touch();
    }

    /// The microphone input this session reads from
    pub fn audio_input(&self) -> ChannelSource {
        self.audio_in.clone()
    }

    pub async fn commit(&self) -> bool {
        self.touch();
        self.commands.send(SessionCommand::Commit).await.is_ok()
    }

    pub async fn clear(&self) -> bool {
        self.touch();
        self.commands.send(SessionCommand::Clear).await.is_ok()
    }

    /// Ask the runner to end the session. The first reason wins; returns
    /// whether this call was the one that stopped it.
    pub fn shutdown(&self, reason: EndReason) -> bool {
        let first = match self.stop_reason.lock() {
            Ok(mut stop) if stop.is_none() => {
                *stop = Some(reason);
                true
            }
            _ => false,
        };
        self.cancel.cancel();
        first
    }

    pub fn is_ended(&self) -> bool {
        self.ended.borrow().is_some()
    }

    /// Wait for the runner to finish
    pub async fn wait(&self) -> EndReason {
        let mut rx = self.ended.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return EndReason::Stopped;
            }
        }
    }

    /// Fetch the current balance from the ledger
    pub async fn credits_balance(&self) -> Result<i64, LedgerError> {
        self.credits.refresh().await
    }

    /// Media produced by tools, newest first
    pub fn recent_media(&self, limit: usize) -> Vec<MediaItem> {
        self.media
            .lock()
            .map(|m| m.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn search_media(&self, query: &str) -> Vec<MediaItem> {
        self.media
            .lock()
            .map(|m| m.iter().rev().filter(|item| item.matches(query)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            conversation_id: self.id.clone(),
            owner: self.owner.clone(),
            mode: self.mode,
            phase: self.phase(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    pub(crate) fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.last_activity.lock().map(|l| *l).unwrap_or_else(|_| Instant::now())
    }

    pub(crate) fn notify(&self, notification: Notification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    pub(crate) fn cache_media(&self, items: Vec<MediaItem>) {
        if items.is_empty() {
            return;
        }
        if let Ok(mut media) = self.media.lock() {
            for item in items {
                debug!("Cached {} {} for {}", item.kind, item.id, self.id);
                media.push_back(item);
            }
            while media.len() > self.media_capacity {
                media.pop_front();
            }
        }
    }

    pub(crate) fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn stop_reason(&self) -> EndReason {
        self.stop_reason.lock().ok().and_then(|r| *r).unwrap_or(EndReason::Stopped)
    }

    pub(crate) fn mark_ended(&self, reason: EndReason) {
        self.ended.send_replace(Some(reason));
    }
}

/// What a caller decides per conversation
pub struct SessionOptions {
    pub conversation_id: ConversationId,
    pub owner: OwnerId,
    /// Overrides the configured capture mode
    pub mode: Option<CaptureMode>,
    pub playback: Arc<dyn PlaybackSink>,
}

impl SessionOptions {
    pub fn new(conversation_id: &str, owner: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            owner: owner.to_string(),
            mode: None,
            playback: Arc::new(NullPlayback),
        }
    }

    pub fn with_mode(mut self, mode: CaptureMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_playback(mut self, playback: Arc<dyn PlaybackSink>) -> Self {
        self.playback = playback;
        self
    }
}

/// Starts sessions and keeps them in the registry
pub struct SessionManager {
    config: Arc<Config>,
    connector: Arc<dyn Connector>,
    tools: Arc<ToolRegistry>,
    ledger: Arc<dyn CreditLedger>,
    registry: Arc<SessionRegistry>,
}

impl SessionManager {
    pub fn new(
        config: Arc<Config>,
        connector: Arc<dyn Connector>,
        tools: Arc<ToolRegistry>,
        ledger: Arc<dyn CreditLedger>,
    ) -> Self {
        Self { config, connector, tools, ledger, registry: SessionRegistry::new() }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn CreditLedger> {
        &self.ledger
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Microphone audio held between recordings: one maximum-length utterance
    fn pending_capacity(&self) -> usize {
        let samples = self.config.realtime.sample_rate as u64 * self.config.capture.max_utterance_ms / 1000;
        samples.max(1) as usize
    }

    /// Start a conversation. A live session with the same id is replaced,
    /// provided it has the same owner.
    pub async fn start(&self, options: SessionOptions) -> Result<Arc<Session>, SessionError> {
        let mode = options.mode.unwrap_or(self.config.capture.mode);
        let credits = CreditContext::new(&options.owner, &options.conversation_id, self.ledger.clone());
        let audio_in = ChannelSource::with_capacity(self.pending_capacity());
        let source: Arc<dyn AudioSource> = Arc::new(audio_in.clone());
        let capture = voice::strategy_for(mode, source, &self.config);
        let machine = TurnStateMachine::new(mode);

        let (session, commands) = Session::new(
            &options.conversation_id,
            mode,
            machine.subscribe(),
            audio_in,
            self.tools.clone(),
            credits.clone(),
            self.config.session.media_cache,
        );

        let bridge = ToolInvocationBridge::new(
            self.tools.clone(),
            credits,
            Duration::from_secs(self.config.tools.handler_timeout_secs.max(1)),
        );
        let transport = TransportSession::new(
            self.connector.clone(),
            SessionSettings {
                instructions: self.config.realtime.instructions.clone(),
                voice: self.config.realtime.voice.clone(),
                tools: self.tools.definitions(),
                server_vad: mode == CaptureMode::Stream,
            },
        );

        let runner = SessionRunner::new(
            session.clone(),
            commands,
            transport,
            machine,
            capture,
            bridge,
            options.playback,
            RunnerConfig::from_config(&self.config),
        )
        .with_registry(self.registry.clone());

        self.registry.register(session.clone()).await?;
        info!("Starting {} session {} for {}", mode, session.id(), session.owner());
        tokio::spawn(runner.run());
        Ok(session)
    }

    /// End a conversation and wait until its runner has torn it down.
    /// Returns false when there was nothing live to end.
    pub async fn end(&self, conversation_id: &str) -> bool {
        match self.registry.unregister(conversation_id).await {
            Some(session) => {
                session.wait().await;
                true
            }
            None => false,
        }
    }

    /// End every session, e.g. on server exit
    pub async fn end_all(&self) -> usize {
        let sessions = self.registry.shutdown_all().await;
        for session in &sessions {
            session.wait().await;
        }
        sessions.len()
    }
}
