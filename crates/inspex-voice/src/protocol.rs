//! Wire protocol: outbound message encoding and inbound classification.
//!
//! Two downlink dialects are accepted on the same connection: the native
//! model dialect (`setupComplete`, `serverContent`, `toolCall`) and the relay
//! dialect (`{"type": "session_ready" | "transcript" | ...}`). Either may
//! arrive as a text frame or as JSON inside a binary frame.

use crate::audio::AudioFrame;
use crate::config::{LiveConfig, UplinkMode};
use crate::error::{VoiceError, VoiceResult};
use crate::tools::{FunctionDeclaration, ToolCallRequest, ToolCallResult};
use crate::transport::WireFrame;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

pub const UPLINK_AUDIO_MIME: &str = "audio/pcm;rate=16000";

// ── Setup descriptor ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: SystemInstruction,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSet>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInstruction {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Build the first message of every session.
pub fn build_setup_message(config: &LiveConfig, declarations: Vec<FunctionDeclaration>) -> SetupMessage {
    let model = if config.model.starts_with("models/") {
        config.model.clone()
    } else {
        format!("models/{}", config.model)
    };

    let tools = if declarations.is_empty() {
        Vec::new()
    } else {
        vec![ToolSet {
            function_declarations: declarations,
        }]
    };

    SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: config.response_modalities.clone(),
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: SystemInstruction {
                parts: vec![TextPart {
                    text: config.system_prompt(),
                }],
            },
            tools,
        },
    }
}

// ── Outbound ──────────────────────────────────────────────────────

/// Priority class of an outbound message. Only `Audio` may be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Audio = 0,
    Image = 1,
    ToolResponse = 2,
    Control = 3,
}

#[derive(Debug, Clone)]
pub enum OutboundMessage {
    AudioChunk(AudioFrame),
    ImageChunk {
        data: Vec<u8>,
        mime_type: String,
        note: Option<String>,
    },
    ToolResponse(ToolCallResult),
    ControlSetup(Box<SetupMessage>),
    ControlEndSession,
}

impl OutboundMessage {
    pub fn priority(&self) -> Priority {
        match self {
            OutboundMessage::AudioChunk(_) => Priority::Audio,
            OutboundMessage::ImageChunk { .. } => Priority::Image,
            OutboundMessage::ToolResponse(_) => Priority::ToolResponse,
            OutboundMessage::ControlSetup(_) | OutboundMessage::ControlEndSession => Priority::Control,
        }
    }

    pub fn is_drop_eligible(&self) -> bool {
        self.priority() == Priority::Audio
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::AudioChunk(_) => "audio",
            OutboundMessage::ImageChunk { .. } => "image",
            OutboundMessage::ToolResponse(_) => "tool_response",
            OutboundMessage::ControlSetup(_) => "setup",
            OutboundMessage::ControlEndSession => "end_session",
        }
    }

    /// Frame this message for the wire.
    pub fn encode(&self, mode: UplinkMode) -> VoiceResult<WireFrame> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let value = match self {
            OutboundMessage::AudioChunk(frame) => {
                if mode == UplinkMode::Binary {
                    return Ok(WireFrame::Binary(frame.to_le_bytes()));
                }
                json!({
                    "realtimeInput": {
                        "mediaChunks": [{
                            "mimeType": UPLINK_AUDIO_MIME,
                            "data": b64.encode(frame.to_le_bytes()),
                        }]
                    }
                })
            }
            OutboundMessage::ImageChunk { data, mime_type, note } => {
                let mut parts = vec![json!({
                    "inlineData": { "mimeType": mime_type, "data": b64.encode(data) }
                })];
                if let Some(note) = note {
                    parts.push(json!({ "text": note }));
                }
                json!({
                    "clientContent": {
                        "turns": [{ "role": "user", "parts": parts }],
                        "turnComplete": true,
                    }
                })
            }
            OutboundMessage::ToolResponse(result) => json!({
                "toolResponse": {
                    "functionResponses": [{
                        "id": result.id,
                        "name": result.name,
                        "response": result.response,
                    }]
                }
            }),
            OutboundMessage::ControlSetup(setup) => serde_json::to_value(setup)?,
            OutboundMessage::ControlEndSession => json!({ "type": "end_session" }),
        };
        Ok(WireFrame::Text(serde_json::to_string(&value)?))
    }
}

// ── Inbound ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    SetupComplete,
    /// Raw downlink PCM bytes (24 kHz)
    Audio(Vec<u8>),
    /// Streamed assistant text (model text parts or output transcription)
    TextDelta(String),
    /// Transcription of what the inspector said
    InputTranscript(String),
    ToolCall(Vec<ToolCallRequest>),
    TurnComplete,
    Interrupted,
    ServerError(String),
}

/// Classify one inbound frame.
///
/// Returns an empty list for recognised-but-irrelevant and unknown message
/// types. Undecodable JSON text is `MalformedInbound`; a binary frame that
/// merely looks like JSON is audio.
pub fn classify(frame: WireFrame) -> VoiceResult<Vec<InboundMessage>> {
    match frame {
        WireFrame::Text(text) => classify_json(&text),
        WireFrame::Binary(bytes) => {
            if bytes.first() == Some(&b'{') {
                // PCM can start with 0x7B too; only a frame that parses is control
                let parsed = std::str::from_utf8(&bytes)
                    .ok()
                    .and_then(|text| classify_json(text).ok());
                match parsed {
                    Some(messages) => Ok(messages),
                    None => Ok(vec![InboundMessage::Audio(bytes)]),
                }
            } else if bytes.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![InboundMessage::Audio(bytes)])
            }
        }
    }
}

fn classify_json(text: &str) -> VoiceResult<Vec<InboundMessage>> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| VoiceError::MalformedInbound(e.to_string()))?;

    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        return classify_relay(kind, &value);
    }

    let mut out = Vec::new();

    if value.get("setupComplete").is_some() {
        out.push(InboundMessage::SetupComplete);
    }

    if let Some(content) = value.get("serverContent") {
        if let Some(parts) = content.pointer("/modelTurn/parts").and_then(Value::as_array) {
            for part in parts {
                if let Some(data) = part.pointer("/inlineData/data").and_then(Value::as_str) {
                    match base64::engine::general_purpose::STANDARD.decode(data) {
                        Ok(bytes) => out.push(InboundMessage::Audio(bytes)),
                        Err(e) => debug!("dropping undecodable inlineData: {}", e),
                    }
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    out.push(InboundMessage::TextDelta(text.to_string()));
                }
            }
        }
        push_transcripts(content, &mut out);
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            out.push(InboundMessage::Interrupted);
        }
        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            out.push(InboundMessage::TurnComplete);
        }
    } else {
        push_transcripts(&value, &mut out);
    }

    if let Some(calls) = value.pointer("/toolCall/functionCalls").and_then(Value::as_array) {
        out.push(InboundMessage::ToolCall(parse_calls(calls)));
    }

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| err.as_str())
            .unwrap_or("unknown server error");
        out.push(InboundMessage::ServerError(message.to_string()));
    }

    if out.is_empty() {
        debug!("ignoring unrecognised inbound message: {}", truncate(text, 120));
    }
    Ok(out)
}

fn classify_relay(kind: &str, value: &Value) -> VoiceResult<Vec<InboundMessage>> {
    let text_field = |key: &str| value.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

    let msg = match kind {
        "session_ready" => InboundMessage::SetupComplete,
        "transcript" => {
            let text = text_field("text");
            if value.get("role").and_then(Value::as_str) == Some("user") {
                InboundMessage::InputTranscript(text)
            } else {
                InboundMessage::TextDelta(text)
            }
        }
        "audio" => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text_field("data"))
                .map_err(|e| VoiceError::MalformedInbound(format!("audio data: {e}")))?;
            InboundMessage::Audio(bytes)
        }
        "tool_call" => {
            let calls = value
                .get("function_calls")
                .and_then(Value::as_array)
                .map(|c| parse_calls(c))
                .unwrap_or_default();
            InboundMessage::ToolCall(calls)
        }
        "turn_complete" => InboundMessage::TurnComplete,
        "interrupted" => InboundMessage::Interrupted,
        "error" => InboundMessage::ServerError(text_field("message")),
        other => {
            debug!("ignoring unknown inbound type '{}'", other);
            return Ok(Vec::new());
        }
    };
    Ok(vec![msg])
}

fn push_transcripts(scope: &Value, out: &mut Vec<InboundMessage>) {
    if let Some(text) = scope.pointer("/inputTranscription/text").and_then(Value::as_str) {
        if !text.is_empty() {
            out.push(InboundMessage::InputTranscript(text.to_string()));
        }
    }
    if let Some(text) = scope.pointer("/outputTranscription/text").and_then(Value::as_str) {
        if !text.is_empty() {
            out.push(InboundMessage::TextDelta(text.to_string()));
        }
    }
}

fn parse_calls(calls: &[Value]) -> Vec<ToolCallRequest> {
    calls
        .iter()
        .map(|call| ToolCallRequest {
            id: call.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            name: call.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            args: call.get("args").cloned().unwrap_or_else(|| json!({})),
        })
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
