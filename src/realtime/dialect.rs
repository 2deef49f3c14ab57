//! Wire dialects
//!
//! `relay` speaks the normalized vocabulary verbatim. `openai` maps it to
//! and from OpenAI Realtime native events:
//!
//! | normalized             | openai                                                   |
//! |------------------------|----------------------------------------------------------|
//! | session.created        | session.created                                          |
//! | input.speech_started   | input_audio_buffer.speech_started                        |
//! | input.speech_stopped   | input_audio_buffer.speech_stopped                        |
//! | response.audio.delta   | response.audio.delta / response.output_audio.delta       |
//! | transcript.user        | conversation.item.input_audio_transcription.completed    |
//! | transcript.assistant   | response.audio_transcript.done                           |
//! | function_call          | response.function_call_arguments.done                    |
//! | function_call.result   | conversation.item.create (function_call_output)          |
//! | control.commit         | input_audio_buffer.commit + response.create              |
//! | control.clear          | input_audio_buffer.clear                                 |

use serde_json::{json, Value};
use tracing::trace;

use super::events::{normalize_arguments, InboundEvent, OutboundEvent};
pub use crate::config::Dialect;
use crate::error::ProtocolError;

/// Encode one outbound event as one or more text frames
pub fn encode(dialect: Dialect, event: &OutboundEvent) -> Result<Vec<String>, serde_json::Error> {
    let values = match dialect {
        Dialect::Relay => vec![serde_json::to_value(event)?],
        Dialect::Openai => encode_openai(event),
    };
    values.iter().map(serde_json::to_string).collect()
}

fn encode_openai(event: &OutboundEvent) -> Vec<Value> {
    match event {
        OutboundEvent::SessionUpdate { instructions, voice, tools, server_vad } => {
            let turn_detection = if *server_vad { json!({"type": "server_vad"}) } else { Value::Null };
            vec![json!({
                "type": "session.update",
                "session": {
                    "instructions": instructions,
                    "voice": voice,
                    "modalities": ["audio", "text"],
                    "input_audio_format": "pcm16",
                    "output_audio_format": "pcm16",
                    "input_audio_transcription": {"model": "whisper-1"},
                    "turn_detection": turn_detection,
                    "tools": tools,
                    "tool_choice": "auto",
                }
            })]
        }
        OutboundEvent::InputAudioAppend { audio } => {
            vec![json!({"type": "input_audio_buffer.append", "audio": audio})]
        }
        OutboundEvent::Commit => vec![
            json!({"type": "input_audio_buffer.commit"}),
            json!({"type": "response.create"}),
        ],
        OutboundEvent::Clear => vec![json!({"type": "input_audio_buffer.clear"})],
        OutboundEvent::FunctionCallResult { call_id, output } => vec![json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": output.to_string(),
            }
        })],
        OutboundEvent::ResponseCreate => vec![json!({"type": "response.create"})],
    }
}

/// Decode one text frame. `Ok(None)` for native events with no normalized
/// counterpart.
pub fn decode(dialect: Dialect, text: &str) -> Result<Option<InboundEvent>, ProtocolError> {
    let event = match dialect {
        Dialect::Relay => decode_relay(text)?,
        Dialect::Openai => {
            let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            decode_openai(&value)?
        }
    };
    Ok(event.map(|ev| match ev {
        InboundEvent::FunctionCall { name, arguments, call_id } => InboundEvent::FunctionCall {
            name,
            arguments: normalize_arguments(arguments),
            call_id,
        },
        other => other,
    }))
}

fn decode_relay(text: &str) -> Result<Option<InboundEvent>, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let known = matches!(
        value.get("type").and_then(Value::as_str),
        Some(
            "session.created"
                | "input.speech_started"
                | "input.speech_stopped"
                | "response.created"
                | "response.done"
                | "response.audio.delta"
                | "transcript.user"
                | "transcript.assistant"
                | "function_call"
                | "error"
        )
    );
    if !known {
        trace!("Ignoring relay event {:?}", value.get("type"));
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn str_field(value: &Value, field: &str) -> Result<String, ProtocolError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Malformed(format!("missing '{}'", field)))
}

fn decode_openai(value: &Value) -> Result<Option<InboundEvent>, ProtocolError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::Malformed("event without type".into()))?;

    let event = match kind {
        "session.created" => InboundEvent::SessionCreated,
        "input_audio_buffer.speech_started" => InboundEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => InboundEvent::SpeechStopped,
        "response.created" => InboundEvent::ResponseCreated,
        "response.done" => InboundEvent::ResponseDone,
        "response.audio.delta" | "response.output_audio.delta" => InboundEvent::AudioDelta {
            delta: str_field(value, "delta")?,
        },
        "conversation.item.input_audio_transcription.completed" => InboundEvent::UserTranscript {
            text: str_field(value, "transcript")?,
        },
        "response.audio_transcript.done" | "response.output_audio_transcript.done" => {
            InboundEvent::AssistantTranscript { text: str_field(value, "transcript")? }
        }
        "response.function_call_arguments.done" => InboundEvent::FunctionCall {
            name: str_field(value, "name")?,
            arguments: value.get("arguments").cloned().unwrap_or(Value::Null),
            call_id: str_field(value, "call_id")?,
        },
        "error" => {
            let err = value.get("error").unwrap_or(value);
            InboundEvent::Error {
                code: err.get("code").and_then(Value::as_str).map(str::to_string),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }
        }
        other => {
            trace!("Ignoring native event {}", other);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(dialect: Dialect, v: Value) -> Option<InboundEvent> {
        decode(dialect, &v.to_string()).unwrap()
    }

    #[test]
    fn test_openai_function_call_arguments_parsed() {
        let ev = decode_one(
            Dialect::Openai,
            json!({
                "type": "response.function_call_arguments.done",
                "name": "send_message",
                "call_id": "call_7",
                "arguments": "{\"to\":\"ana\",\"body\":\"hi\"}"
            }),
        );
        assert_eq!(
            ev,
            Some(InboundEvent::FunctionCall {
                name: "send_message".into(),
                arguments: json!({"to": "ana", "body": "hi"}),
                call_id: "call_7".into(),
            })
        );
    }

    #[test]
    fn test_openai_phase_events() {
        assert_eq!(
            decode_one(Dialect::Openai, json!({"type": "input_audio_buffer.speech_stopped"})),
            Some(InboundEvent::SpeechStopped)
        );
        assert_eq!(
            decode_one(Dialect::Openai, json!({"type": "response.output_audio.delta", "delta": "AAA="})),
            Some(InboundEvent::AudioDelta { delta: "AAA=".into() })
        );
        assert_eq!(
            decode_one(
                Dialect::Openai,
                json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": "hello"})
            ),
            Some(InboundEvent::UserTranscript { text: "hello".into() })
        );
    }

    #[test]
    fn test_openai_error_shape() {
        let ev = decode_one(
            Dialect::Openai,
            json!({"type": "error", "error": {"code": "invalid_value", "message": "bad voice"}}),
        );
        assert_eq!(
            ev,
            Some(InboundEvent::Error { code: Some("invalid_value".into()), message: "bad voice".into() })
        );
    }

    #[test]
    fn test_unknown_events_ignored() {
        assert_eq!(decode_one(Dialect::Openai, json!({"type": "rate_limits.updated"})), None);
        assert_eq!(decode_one(Dialect::Relay, json!({"type": "heartbeat"})), None);
    }

    #[test]
    fn test_malformed_frames() {
        assert!(decode(Dialect::Relay, "{not json").is_err());
        assert!(decode(Dialect::Openai, r#"{"type":"response.audio.delta"}"#).is_err());
        assert!(decode(Dialect::Relay, r#"{"type":"function_call","name":"x"}"#).is_err());
    }

    #[test]
    fn test_relay_is_verbatim() {
        let frames = encode(Dialect::Relay, &OutboundEvent::Commit).unwrap();
        assert_eq!(frames, vec![r#"{"type":"control.commit"}"#.to_string()]);
        let ev = decode_one(Dialect::Relay, json!({"type": "function_call", "name": "x", "call_id": "c", "arguments": "{}"}));
        assert_eq!(
            ev,
            Some(InboundEvent::FunctionCall { name: "x".into(), arguments: json!({}), call_id: "c".into() })
        );
    }

    #[test]
    fn test_openai_commit_requests_response() {
        let frames = encode(Dialect::Openai, &OutboundEvent::Commit).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains("input_audio_buffer.commit"));
        assert!(frames[1].contains("response.create"));
    }

    #[test]
    fn test_openai_result_output_is_string() {
        let frames = encode(
            Dialect::Openai,
            &OutboundEvent::FunctionCallResult { call_id: "c1".into(), output: json!({"success": false}) },
        )
        .unwrap();
        let v: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["item"]["type"], "function_call_output");
        assert_eq!(v["item"]["output"], "{\"success\":false}");
    }

    #[test]
    fn test_openai_session_update_turn_detection() {
        let update = OutboundEvent::SessionUpdate {
            instructions: "be brief".into(),
            voice: "alloy".into(),
            tools: vec![],
            server_vad: false,
        };
        let v: Value = serde_json::from_str(&encode(Dialect::Openai, &update).unwrap()[0]).unwrap();
        assert_eq!(v["session"]["turn_detection"], Value::Null);
        assert_eq!(v["session"]["voice"], "alloy");
    }
}
