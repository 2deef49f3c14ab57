//! The task that drives one conversation
//!
//! One select loop owns every piece of per-session state, so transitions,
//! sends and tool results are processed strictly one at a time.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::registry::SessionRegistry;
use super::{EndReason, Notification, PlaybackSink, Session, SessionCommand, ToolStatus};
use crate::config::Config;
use crate::error::TransportError;
use crate::realtime::events::decode_audio;
use crate::realtime::{CaptureCommand, InboundEvent, OutboundEvent, Phase, Transition, TransportSession, TurnInput, TurnStateMachine};
use crate::tools::{ToolCall, ToolInvocationBridge, ToolResult};
use crate::types::{MediaItem, Role, Transcript};
use crate::voice::{AudioCaptureStrategy, CaptureMode, CaptureSignal, Utterance};

/// Session tuning taken from [`Config`]
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub idle_timeout: Duration,
    pub transcript_capacity: usize,
    pub replay_turns: usize,
    pub max_reconnects: u32,
    pub reconnect_backoff: Duration,
    /// Samples per `input_audio.append` when flushing an utterance
    pub append_samples: usize,
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: Duration::from_secs(config.session.idle_timeout_secs.max(1)),
            transcript_capacity: config.session.transcript_capacity,
            replay_turns: config.session.replay_turns,
            max_reconnects: config.session.max_reconnects,
            reconnect_backoff: Duration::from_millis(config.session.reconnect_backoff_ms),
            append_samples: (config.realtime.sample_rate as usize).max(1),
        }
    }
}

/// What became of an outbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    /// Refused before configuration; the connection is still usable
    Dropped,
    /// The send failed and a fresh connection replaced the old one. Work
    /// that belonged to the old connection must not continue on the new one.
    Reconnected,
}

pub struct SessionRunner {
    session: Arc<Session>,
    commands: mpsc::Receiver<SessionCommand>,
    transport: TransportSession,
    machine: TurnStateMachine,
    capture: Arc<dyn AudioCaptureStrategy>,
    capture_tx: mpsc::Sender<CaptureSignal>,
    capture_rx: mpsc::Receiver<CaptureSignal>,
    bridge: Arc<ToolInvocationBridge>,
    results_tx: mpsc::Sender<ToolResult>,
    results_rx: mpsc::Receiver<ToolResult>,
    playback: Arc<dyn PlaybackSink>,
    registry: Option<Arc<SessionRegistry>>,
    transcript: Transcript,
    config: RunnerConfig,
    reconnects: u32,
}

impl SessionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Session>,
        commands: mpsc::Receiver<SessionCommand>,
        transport: TransportSession,
        machine: TurnStateMachine,
        capture: Arc<dyn AudioCaptureStrategy>,
        bridge: Arc<ToolInvocationBridge>,
        playback: Arc<dyn PlaybackSink>,
        config: RunnerConfig,
    ) -> Self {
        let (capture_tx, capture_rx) = mpsc::channel(64);
        let (results_tx, results_rx) = mpsc::channel(32);
        Self {
            session,
            commands,
            transport,
            machine,
            capture,
            capture_tx,
            capture_rx,
            bridge,
            results_tx,
            results_rx,
            playback,
            registry: None,
            transcript: Transcript::new(config.transcript_capacity),
            config,
            reconnects: 0,
        }
    }

    /// Remove the session from `registry` when it ends
    pub fn with_registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run until the session ends
    pub async fn run(mut self) -> EndReason {
        let reason = match self.connect_with_retry(None).await {
            Ok(()) => self.event_loop().await,
            Err(reason) => reason,
        };
        self.teardown(reason).await;
        reason
    }

    async fn event_loop(&mut self) -> EndReason {
        let cancel = self.session.cancelled();
        loop {
            let idle_deadline = self.session.last_activity() + self.config.idle_timeout;
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.session.stop_reason(),
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                event = self.transport.next_event() => match event {
                    Ok(event) => {
                        self.session.touch();
                        self.handle_event(event).await
                    }
                    Err(e) => self.recover(e).await,
                },
                Some(result) = self.results_rx.recv() => self.handle_result(result).await,
                Some(signal) = self.capture_rx.recv() => self.handle_capture(signal).await,
                _ = tokio::time::sleep_until(idle_deadline) => {
                    if self.session.last_activity() + self.config.idle_timeout <= Instant::now() {
                        info!("Session {} idle for {:?}", self.session.id(), self.config.idle_timeout);
                        return EndReason::IdleTimeout;
                    }
                    Ok(())
                }
            };
            if let Err(reason) = step {
                return reason;
            }
        }
    }

    /// Apply an input and carry out the side effects it asks for
    fn apply(&mut self, input: TurnInput) -> Transition {
        let t = self.machine.apply(input);
        match t.capture {
            Some(CaptureCommand::Start) => {
                if !self.capture.start(self.capture_tx.clone()) {
                    debug!("Capture already running");
                }
            }
            Some(CaptureCommand::Stop) => self.capture.stop(),
            None => {}
        }
        if t.stop_playback {
            self.playback.stop();
        }
        if t.changed() {
            self.session.notify(Notification::Phase { phase: t.to });
        }
        t
    }

    async fn send(&mut self, event: OutboundEvent) -> Result<Delivery, EndReason> {
        match self.transport.send(event).await {
            Ok(()) => Ok(Delivery::Sent),
            Err(e) if e.is_refusal() => {
                debug!("Dropped frame in {}: {}", self.session.id(), e);
                Ok(Delivery::Dropped)
            }
            Err(e) => {
                self.recover(e).await?;
                Ok(Delivery::Reconnected)
            }
        }
    }

    async fn handle_event(&mut self, event: InboundEvent) -> Result<(), EndReason> {
        match event {
            InboundEvent::SessionCreated => match self.transport.configure().await {
                Ok(true) => {
                    self.reconnects = 0;
                    self.apply(TurnInput::Start);
                }
                Ok(false) => debug!("Ignoring repeated session.created"),
                Err(e) => return self.recover(e).await,
            },
            InboundEvent::SpeechStarted => {
                self.apply(TurnInput::SpeechStarted);
            }
            InboundEvent::SpeechStopped => {
                // Under buffering the local detector owns end of speech
                if self.machine.mode() == CaptureMode::Stream {
                    self.apply(TurnInput::EndOfSpeech);
                }
            }
            InboundEvent::ResponseCreated => {
                self.apply(TurnInput::ResponseStarted);
            }
            InboundEvent::ResponseDone => {
                let calls_in_flight = self.bridge.in_flight();
                self.apply(TurnInput::ResponseDone { calls_in_flight });
            }
            InboundEvent::AudioDelta { delta } => {
                let t = self.apply(TurnInput::AudioChunk);
                if t.play_audio {
                    match decode_audio(&delta) {
                        Some(samples) => self.playback.play(samples),
                        None => warn!("Undecodable audio delta ({} bytes)", delta.len()),
                    }
                }
            }
            InboundEvent::UserTranscript { text } => self.record_transcript(Role::User, &text),
            InboundEvent::AssistantTranscript { text } => self.record_transcript(Role::Assistant, &text),
            InboundEvent::FunctionCall { name, arguments, call_id } => {
                self.on_function_call(ToolCall {
                    call_id,
                    name,
                    arguments,
                    conversation_id: self.session.id().to_string(),
                });
            }
            InboundEvent::Error { code, message } => {
                warn!("Model error in {}: {}", self.session.id(), message);
                self.session
                    .notify(Notification::error(code.as_deref().unwrap_or("model_error"), message));
            }
        }
        Ok(())
    }

    fn record_transcript(&mut self, role: Role, text: &str) {
        if let Some(turn) = self.transcript.append(role, text) {
            self.session.notify(Notification::Transcript { turn });
        }
    }

    fn on_function_call(&mut self, call: ToolCall) {
        self.apply(TurnInput::FunctionCall);
        if let Err(violation) = self.bridge.begin(&call) {
            warn!("Protocol violation in {}: {}", self.session.id(), violation);
            self.session.notify(Notification::error("protocol_error", violation.to_string()));
            return;
        }
        info!("Tool call {} ({}) in {}", call.name, call.call_id, self.session.id());
        self.session.notify(Notification::ToolUpdate {
            call_id: call.call_id.clone(),
            tool: call.name.clone(),
            status: ToolStatus::Running,
            message: None,
            credits_charged: 0,
        });
        self.bridge.spawn(call, self.results_tx.clone());
    }

    async fn handle_result(&mut self, result: ToolResult) -> Result<(), EndReason> {
        let remaining = match self.bridge.finish(&result.call_id) {
            Ok(remaining) => remaining,
            Err(e) => {
                debug!("Discarding tool result: {}", e);
                return Ok(());
            }
        };

        if result.success {
            if let Some(data) = &result.data {
                self.session.cache_media(MediaItem::from_tool_data(data));
            }
        }
        self.session.notify(Notification::ToolUpdate {
            call_id: result.call_id.clone(),
            tool: result.name.clone(),
            status: if result.success { ToolStatus::Done } else { ToolStatus::Failed },
            message: result.message.clone(),
            credits_charged: result.credits_charged,
        });
        if result.credits_charged > 0 {
            if let Some(balance) = self.session.credits().snapshot() {
                self.session.notify(Notification::Credits { balance });
            }
        }

        let output = result.output();
        let delivery = self.send(OutboundEvent::FunctionCallResult { call_id: result.call_id, output }).await?;
        if delivery == Delivery::Sent && remaining == 0 {
            self.send(OutboundEvent::ResponseCreate).await?;
        }
        Ok(())
    }

    async fn handle_capture(&mut self, signal: CaptureSignal) -> Result<(), EndReason> {
        match signal {
            CaptureSignal::Utterance(utterance) => self.flush_utterance(utterance).await,
            CaptureSignal::NoSpeech => {
                debug!("Recording closed without speech");
                self.apply(TurnInput::NoSpeech);
                Ok(())
            }
            CaptureSignal::Chunk(samples) => {
                if self.machine.phase() == Phase::Idle {
                    return Ok(());
                }
                self.send(OutboundEvent::audio(&samples)).await?;
                Ok(())
            }
        }
    }

    async fn flush_utterance(&mut self, utterance: Utterance) -> Result<(), EndReason> {
        if self.machine.phase() != Phase::Listening {
            debug!("Dropping utterance captured outside listening");
            return Ok(());
        }
        info!(
            "Utterance closed ({:?}, {:.1}s, {} samples)",
            utterance.reason,
            utterance.duration.as_secs_f32(),
            utterance.samples.len()
        );
        for chunk in utterance.samples.chunks(self.config.append_samples) {
            if self.send(OutboundEvent::audio(chunk)).await? != Delivery::Sent {
                return Ok(());
            }
        }
        if self.send(OutboundEvent::Commit).await? == Delivery::Sent {
            self.apply(TurnInput::EndOfSpeech);
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<(), EndReason> {
        match (command, self.machine.mode()) {
            (SessionCommand::Commit, CaptureMode::Stream) => {
                if self.machine.phase() != Phase::Listening {
                    return Ok(());
                }
                if self.send(OutboundEvent::Commit).await? == Delivery::Sent {
                    self.apply(TurnInput::EndOfSpeech);
                }
            }
            (SessionCommand::Commit, CaptureMode::Buffered) => {
                debug!("Manual commit ignored; the recorder decides end of speech");
            }
            (SessionCommand::Clear, CaptureMode::Stream) => {
                self.capture.clear();
                self.send(OutboundEvent::Clear).await?;
            }
            (SessionCommand::Clear, CaptureMode::Buffered) => {
                // Drop the open recording and start a fresh one if still listening
                self.capture.stop();
                self.capture.clear();
                self.apply(TurnInput::NoSpeech);
            }
        }
        Ok(())
    }

    /// Tear everything down after a transport failure and open a fresh
    /// connection seeded with the recent transcript.
    async fn recover(&mut self, err: TransportError) -> Result<(), EndReason> {
        if err.is_terminal() {
            error!("Session {} rejected by the model: {}", self.session.id(), err);
            self.session.notify(Notification::error("auth_failed", err.to_string()));
            return Err(EndReason::AuthFailed);
        }
        warn!("Transport lost in {}: {}", self.session.id(), err);
        if self.reconnects >= self.config.max_reconnects {
            self.session.notify(Notification::error("transport_failed", err.to_string()));
            return Err(EndReason::TransportFailed);
        }
        self.reconnects += 1;

        self.apply(TurnInput::Stop);
        self.capture.clear();
        self.transport.close();
        let abandoned = self.bridge.abandon_all();
        if abandoned > 0 {
            info!("Abandoned {} tool call(s) from the lost connection", abandoned);
        }
        while self.capture_rx.try_recv().is_ok() {}
        self.session.notify(Notification::error("transport_lost", err.to_string()));

        let digest = self.transcript.digest(self.config.replay_turns);
        self.connect_with_retry(digest).await
    }

    async fn connect_with_retry(&mut self, resume: Option<String>) -> Result<(), EndReason> {
        let cancel = self.session.cancelled();
        loop {
            let err = match self.transport.connect(resume.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if err.is_terminal() {
                error!("Cannot connect {}: {}", self.session.id(), err);
                self.session.notify(Notification::error("auth_failed", err.to_string()));
                return Err(EndReason::AuthFailed);
            }
            if self.reconnects >= self.config.max_reconnects {
                error!("Giving up on {} after {} reconnect attempts: {}", self.session.id(), self.reconnects, err);
                self.session.notify(Notification::error("transport_failed", err.to_string()));
                return Err(EndReason::TransportFailed);
            }
            let delay = self.config.reconnect_backoff * 2u32.saturating_pow(self.reconnects);
            self.reconnects += 1;
            warn!("Connect failed ({}); retry {} in {:?}", err, self.reconnects, delay);
            tokio::select! {
                _ = cancel.cancelled() => return Err(self.session.stop_reason()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Stop capture, stop playback, close the transport, then leave the
    /// registry.
    async fn teardown(&mut self, reason: EndReason) {
        self.apply(TurnInput::Stop);
        self.transport.close();
        self.bridge.abandon_all();
        if let Some(registry) = &self.registry {
            registry.remove_instance(self.session.id(), self.session.instance()).await;
        }
        info!("Session {} ended: {:?}", self.session.id(), reason);
        self.session.notify(Notification::Ended { reason });
        self.session.mark_ended(reason);
    }
}
