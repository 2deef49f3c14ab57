//! Turn state machine
//!
//! ```text
//!          start           end of speech        first audio
//!   idle ────────→ listening ───────────→ thinking ──────────→ speaking
//!    ↑                 ↑  ↑                  │ response done        │
//!    │                 │  └──────────────────┘ (no tool turn open)  │
//!    │                 └────────────────────────────────────────────┘
//!    └──────────────────────── stop (from any phase) ──────────────────
//! ```
//!
//! The machine is the only place that decides when local capture starts
//! or stops. Under utterance buffering capture never runs while speaking.
//!
//! A response that issued a function call is not the end of the turn: the
//! phase holds at thinking until the model starts the follow-up response.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

use crate::voice::CaptureMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Listening => "listening",
            Phase::Thinking => "thinking",
            Phase::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

/// Everything that can move the conversation along
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnInput {
    /// Session is configured and ready
    Start,
    /// Explicit stop, teardown or transport loss
    Stop,
    /// Local utterance closed, remote speech stopped, or a manual commit
    EndOfSpeech,
    /// The buffered recorder closed without detecting speech
    NoSpeech,
    /// The model heard the user start speaking
    SpeechStarted,
    ResponseStarted,
    AudioChunk,
    ResponseDone { calls_in_flight: usize },
    FunctionCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureCommand {
    Start,
    Stop,
}

/// Side effects the caller must carry out for one input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
    pub capture: Option<CaptureCommand>,
    pub stop_playback: bool,
    /// For `AudioChunk`: whether the audio should reach the speaker
    pub play_audio: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

pub struct TurnStateMachine {
    mode: CaptureMode,
    phase: Phase,
    /// Audio of an interrupted response is dropped until the next response starts
    suppress_audio: bool,
    /// A function call was issued and the follow-up response has not started
    awaiting_continuation: bool,
    tx: watch::Sender<Phase>,
}

impl TurnStateMachine {
    pub fn new(mode: CaptureMode) -> Self {
        let (tx, _rx) = watch::channel(Phase::Idle);
        Self { mode, phase: Phase::Idle, suppress_audio: false, awaiting_continuation: false, tx }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn awaiting_continuation(&self) -> bool {
        self.awaiting_continuation
    }

    /// Phase notifications
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.tx.subscribe()
    }

    pub fn apply(&mut self, input: TurnInput) -> Transition {
        let from = self.phase;
        let buffered = self.mode == CaptureMode::Buffered;
        let mut t = Transition { from, to: from, capture: None, stop_playback: false, play_audio: false };

        match (input, from) {
            (TurnInput::Start, Phase::Idle) => {
                t.to = Phase::Listening;
                t.capture = Some(CaptureCommand::Start);
            }
            (TurnInput::Start, _) => {}

            (TurnInput::Stop, _) => {
                t.to = Phase::Idle;
                t.capture = Some(CaptureCommand::Stop);
                t.stop_playback = true;
                self.suppress_audio = false;
                self.awaiting_continuation = false;
            }

            (TurnInput::EndOfSpeech, Phase::Listening) => {
                t.to = Phase::Thinking;
                if buffered {
                    t.capture = Some(CaptureCommand::Stop);
                }
            }
            (TurnInput::EndOfSpeech, _) => {}

            (TurnInput::NoSpeech, Phase::Listening) => {
                t.capture = Some(CaptureCommand::Start);
            }
            (TurnInput::NoSpeech, _) => {}

            // Barge-in: the user talks over the response
            (TurnInput::SpeechStarted, Phase::Speaking) if !buffered => {
                t.to = Phase::Listening;
                t.stop_playback = true;
                self.suppress_audio = true;
            }
            (TurnInput::SpeechStarted, _) => {}

            (TurnInput::ResponseStarted, _) => {
                self.suppress_audio = false;
                self.awaiting_continuation = false;
            }

            (TurnInput::AudioChunk, Phase::Idle) => {}
            (TurnInput::AudioChunk, _) if self.suppress_audio => {}
            (TurnInput::AudioChunk, Phase::Thinking | Phase::Listening) => {
                self.awaiting_continuation = false;
                t.to = Phase::Speaking;
                t.play_audio = true;
                if buffered {
                    t.capture = Some(CaptureCommand::Stop);
                }
            }
            (TurnInput::AudioChunk, Phase::Speaking) => {
                t.play_audio = true;
            }

            // Spoke, then called a tool: wait for the follow-up response
            (TurnInput::ResponseDone { .. }, Phase::Speaking) if self.awaiting_continuation => {
                t.to = Phase::Thinking;
            }
            (TurnInput::ResponseDone { .. }, Phase::Speaking) => {
                t.to = Phase::Listening;
                t.capture = Some(CaptureCommand::Start);
            }
            (TurnInput::ResponseDone { calls_in_flight: 0 }, Phase::Thinking) if !self.awaiting_continuation => {
                t.to = Phase::Listening;
                t.capture = Some(CaptureCommand::Start);
            }
            (TurnInput::ResponseDone { .. }, _) => {}

            (TurnInput::FunctionCall, Phase::Idle) => {}
            (TurnInput::FunctionCall, _) => {
                self.awaiting_continuation = true;
            }
        }

        if t.changed() {
            debug!("Phase {} -> {} on {:?}", from, t.to, input);
            self.phase = t.to;
            self.tx.send_replace(t.to);
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(mode: CaptureMode) -> TurnStateMachine {
        let mut m = TurnStateMachine::new(mode);
        m.apply(TurnInput::Start);
        m
    }

    #[test]
    fn test_full_cycle() {
        let mut m = TurnStateMachine::new(CaptureMode::Buffered);
        let mut rx = m.subscribe();
        assert_eq!(m.apply(TurnInput::Start).capture, Some(CaptureCommand::Start));
        assert_eq!(*rx.borrow_and_update(), Phase::Listening);

        assert_eq!(m.apply(TurnInput::EndOfSpeech).to, Phase::Thinking);
        assert_eq!(m.apply(TurnInput::ResponseStarted).to, Phase::Thinking);
        let t = m.apply(TurnInput::AudioChunk);
        assert_eq!(t.to, Phase::Speaking);
        assert!(t.play_audio);
        let t = m.apply(TurnInput::ResponseDone { calls_in_flight: 0 });
        assert_eq!(t.to, Phase::Listening);
        assert_eq!(t.capture, Some(CaptureCommand::Start));

        let t = m.apply(TurnInput::Stop);
        assert_eq!(t.to, Phase::Idle);
        assert!(t.stop_playback);
        assert_eq!(*rx.borrow_and_update(), Phase::Idle);
    }

    #[test]
    fn test_first_audio_while_thinking_moves_to_speaking_immediately() {
        let mut m = machine(CaptureMode::Stream);
        m.apply(TurnInput::EndOfSpeech);
        m.apply(TurnInput::AudioChunk);
        assert_eq!(m.phase(), Phase::Speaking);
        // The next chunk is processed in speaking
        let t = m.apply(TurnInput::AudioChunk);
        assert_eq!(t.from, Phase::Speaking);
        assert!(!t.changed());
    }

    #[test]
    fn test_function_call_does_not_change_phase() {
        let mut m = machine(CaptureMode::Buffered);
        m.apply(TurnInput::EndOfSpeech);
        assert!(!m.apply(TurnInput::FunctionCall).changed());
        // Response that only carried the call: stays thinking while it runs
        assert!(!m.apply(TurnInput::ResponseDone { calls_in_flight: 1 }).changed());
        assert_eq!(m.phase(), Phase::Thinking);
    }

    #[test]
    fn test_fast_tool_result_holds_thinking_until_continuation() {
        let mut m = machine(CaptureMode::Buffered);
        m.apply(TurnInput::EndOfSpeech);
        m.apply(TurnInput::ResponseStarted);
        m.apply(TurnInput::FunctionCall);
        assert!(m.awaiting_continuation());

        // The result went out before the call's own response finished
        let t = m.apply(TurnInput::ResponseDone { calls_in_flight: 0 });
        assert!(!t.changed());
        assert_eq!(t.capture, None);
        assert_eq!(m.phase(), Phase::Thinking);

        // Follow-up response after the tool result
        m.apply(TurnInput::ResponseStarted);
        assert!(!m.awaiting_continuation());
        assert_eq!(m.apply(TurnInput::AudioChunk).to, Phase::Speaking);
        let t = m.apply(TurnInput::ResponseDone { calls_in_flight: 0 });
        assert_eq!(t.to, Phase::Listening);
        assert_eq!(t.capture, Some(CaptureCommand::Start));
    }

    #[test]
    fn test_text_only_response_returns_to_listening() {
        let mut m = machine(CaptureMode::Buffered);
        m.apply(TurnInput::EndOfSpeech);
        m.apply(TurnInput::ResponseStarted);
        assert_eq!(m.apply(TurnInput::ResponseDone { calls_in_flight: 0 }).to, Phase::Listening);
    }

    #[test]
    fn test_spoken_preamble_then_tool_call_waits_in_thinking() {
        let mut m = machine(CaptureMode::Buffered);
        m.apply(TurnInput::EndOfSpeech);
        m.apply(TurnInput::ResponseStarted);
        m.apply(TurnInput::AudioChunk);
        m.apply(TurnInput::FunctionCall);
        let t = m.apply(TurnInput::ResponseDone { calls_in_flight: 1 });
        assert_eq!(t.to, Phase::Thinking);
        assert_eq!(t.capture, None);
    }

    #[test]
    fn test_stop_clears_pending_continuation() {
        let mut m = machine(CaptureMode::Stream);
        m.apply(TurnInput::EndOfSpeech);
        m.apply(TurnInput::FunctionCall);
        m.apply(TurnInput::Stop);
        assert!(!m.awaiting_continuation());
    }

    #[test]
    fn test_buffered_capture_never_runs_while_speaking() {
        let mut m = machine(CaptureMode::Buffered);
        let mut capturing = true;
        let inputs = [
            TurnInput::AudioChunk,
            TurnInput::SpeechStarted,
            TurnInput::NoSpeech,
            TurnInput::AudioChunk,
            TurnInput::ResponseDone { calls_in_flight: 0 },
            TurnInput::EndOfSpeech,
            TurnInput::AudioChunk,
            TurnInput::Start,
        ];
        for input in inputs {
            let t = m.apply(input);
            match t.capture {
                Some(CaptureCommand::Start) => capturing = true,
                Some(CaptureCommand::Stop) => capturing = false,
                None => {}
            }
            assert!(!(capturing && m.phase() == Phase::Speaking), "capturing while speaking after {:?}", input);
        }
    }

    #[test]
    fn test_barge_in_under_stream() {
        let mut m = machine(CaptureMode::Stream);
        m.apply(TurnInput::EndOfSpeech);
        m.apply(TurnInput::AudioChunk);
        let t = m.apply(TurnInput::SpeechStarted);
        assert_eq!(t.to, Phase::Listening);
        assert!(t.stop_playback);
        // Stream capture keeps running through the barge-in
        assert_eq!(t.capture, None);

        // Leftover audio of the interrupted response is dropped
        let t = m.apply(TurnInput::AudioChunk);
        assert!(!t.play_audio);
        assert_eq!(m.phase(), Phase::Listening);

        m.apply(TurnInput::EndOfSpeech);
        m.apply(TurnInput::ResponseStarted);
        assert!(m.apply(TurnInput::AudioChunk).play_audio);
    }

    #[test]
    fn test_no_barge_in_when_buffered() {
        let mut m = machine(CaptureMode::Buffered);
        m.apply(TurnInput::EndOfSpeech);
        m.apply(TurnInput::AudioChunk);
        assert!(!m.apply(TurnInput::SpeechStarted).changed());
    }

    #[test]
    fn test_no_speech_restarts_recording_only_when_listening() {
        let mut m = machine(CaptureMode::Buffered);
        assert_eq!(m.apply(TurnInput::NoSpeech).capture, Some(CaptureCommand::Start));
        m.apply(TurnInput::EndOfSpeech);
        assert_eq!(m.apply(TurnInput::NoSpeech).capture, None);
    }

    #[test]
    fn test_audio_ignored_when_idle() {
        let mut m = TurnStateMachine::new(CaptureMode::Stream);
        let t = m.apply(TurnInput::AudioChunk);
        assert!(!t.play_audio);
        assert_eq!(m.phase(), Phase::Idle);
    }
}
