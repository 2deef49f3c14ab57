//! Normalized event vocabulary exchanged with the speech model

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use serde::{Deserialize, Serialize};

use crate::tools::ToolDefinition;
use crate::voice::source::{pcm16_from_bytes, pcm16_to_bytes};

/// Events coming from the model (or relay)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum InboundEvent {
    /// The channel is ready for configuration
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "input.speech_started")]
    SpeechStarted,
    #[serde(rename = "input.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.created")]
    ResponseCreated,
    #[serde(rename = "response.done")]
    ResponseDone,
    /// Base64 PCM16 response audio
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "transcript.user")]
    UserTranscript { text: String },
    #[serde(rename = "transcript.assistant")]
    AssistantTranscript { text: String },
    #[serde(rename = "function_call")]
    FunctionCall {
        name: String,
        #[serde(default)]
        arguments: serde_json::Value,
        call_id: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
}

impl InboundEvent {
    /// Decoded samples of an audio delta
    pub fn audio_samples(&self) -> Option<Vec<i16>> {
        match self {
            InboundEvent::AudioDelta { delta } => decode_audio(delta),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::SessionCreated => "session.created",
            InboundEvent::SpeechStarted => "input.speech_started",
            InboundEvent::SpeechStopped => "input.speech_stopped",
            InboundEvent::ResponseCreated => "response.created",
            InboundEvent::ResponseDone => "response.done",
            InboundEvent::AudioDelta { .. } => "response.audio.delta",
            InboundEvent::UserTranscript { .. } => "transcript.user",
            InboundEvent::AssistantTranscript { .. } => "transcript.assistant",
            InboundEvent::FunctionCall { .. } => "function_call",
            InboundEvent::Error { .. } => "error",
        }
    }
}

/// Events sent to the model (or relay)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    /// Session configuration; at most once per connection
    #[serde(rename = "session.update")]
    SessionUpdate {
        instructions: String,
        voice: String,
        tools: Vec<ToolDefinition>,
        /// Let the model detect speech boundaries
        #[serde(default)]
        server_vad: bool,
    },
    /// Base64 PCM16 microphone audio
    #[serde(rename = "input_audio.append")]
    InputAudioAppend { audio: String },
    /// Flush the input buffer and request a response
    #[serde(rename = "control.commit")]
    Commit,
    /// Discard unsent input audio
    #[serde(rename = "control.clear")]
    Clear,
    #[serde(rename = "function_call.result")]
    FunctionCallResult {
        call_id: String,
        output: serde_json::Value,
    },
    /// Ask the model to continue the turn
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl OutboundEvent {
    pub fn audio(samples: &[i16]) -> Self {
        OutboundEvent::InputAudioAppend { audio: B64.encode(pcm16_to_bytes(samples)) }
    }
}

/// Decode a base64 PCM16 payload
pub fn decode_audio(payload: &str) -> Option<Vec<i16>> {
    B64.decode(payload).ok().map(|b| pcm16_from_bytes(&b))
}

/// Function-call arguments sometimes arrive as a JSON-encoded string.
/// Decode those; anything that does not parse is passed through unchanged.
pub fn normalize_arguments(arguments: serde_json::Value) -> serde_json::Value {
    match arguments {
        serde_json::Value::String(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(parsed) => parsed,
            Err(_) => serde_json::Value::String(raw),
        },
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    }
}
