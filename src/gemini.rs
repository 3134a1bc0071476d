//! Gemini Live API module
//!
//! Wire types for the BidiGenerateContent WebSocket protocol and the mapping
//! from server messages to [`InboundEvent`]s.

use crate::codec::EncodedAudioChunk;
use crate::config::TalkConfig;
use crate::events::{AudioPayload, InboundEvent, Speaker, TranscriptFragment};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio_tungstenite::tungstenite::Error as WsError;


/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    /// Presence (as `{}`) turns on transcription of the user's audio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<serde_json::Value>,
    /// Presence (as `{}`) turns on transcription of the model's audio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<RealtimeAudio>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeAudio {
    pub data: String,
    pub mime_type: String,
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn audio(chunk: EncodedAudioChunk) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(RealtimeAudio {
                data: chunk.data,
                mime_type: chunk.mime_type,
            }),
            audio_stream_end: None,
        })
    }

    pub fn audio_stream_end() -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            audio_stream_end: Some(true),
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(GeminiError::Serialization)
    }
}

/// Server -> client messages. Only the fields this client acts on.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<serde_json::Value>,
    pub tool_call: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ModelPart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelPart {
    pub text: Option<String>,
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct Transcription {
    pub text: Option<String>,
}

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// One server message split into the events it carries.
#[derive(Debug, Default)]
pub struct ParsedMessage {
    pub setup_complete: bool,
    pub events: SmallVec<[InboundEvent; 4]>,
}

/// Build the setup message for a conversation.
pub fn live_setup(config: &TalkConfig) -> BidiGenerateContentSetup {
    let speech_config = config.voice.as_ref().map(|voice| {
        serde_json::json!({
            "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": voice}}
        })
    });

    BidiGenerateContentSetup {
        model: config.model.clone(),
        generation_config: Some(GenerationConfig {
            response_modalities: vec!["AUDIO".to_string()],
            speech_config,
        }),
        system_instruction: Some(Content {
            parts: vec![Part {
                text: Some(config.system_instruction()),
            }],
        }),
        input_audio_transcription: Some(serde_json::json!({})),
        output_audio_transcription: Some(serde_json::json!({})),
    }
}

/// Parse one text frame from the server.
///
/// Events come out in the order the session must apply them: interruption,
/// user text, agent text, audio, then turn completion.
pub fn parse_server_message(text: &str) -> Result<ParsedMessage> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut parsed = ParsedMessage {
        setup_complete: message.setup_complete.is_some(),
        ..Default::default()
    };

    if let Some(content) = message.server_content {
        if content.interrupted {
            parsed.events.push(InboundEvent::Interrupted);
        }

        let transcriptions = [
            (Speaker::User, content.input_transcription),
            (Speaker::Agent, content.output_transcription),
        ];
        for (speaker, transcription) in transcriptions {
            if let Some(text) = transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    parsed.events.push(InboundEvent::Fragment(TranscriptFragment {
                        speaker,
                        text_delta: text,
                    }));
                }
            }
        }

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    parsed.events.push(InboundEvent::Audio(AudioPayload {
                        data: inline.data,
                        mime_type: inline.mime_type,
                    }));
                } else if let Some(text) = part.text {
                    tracing::debug!("Ignoring model text part: {}", text);
                }
            }
        }

        if content.turn_complete {
            parsed.events.push(InboundEvent::TurnComplete);
        }
    }

    if message.go_away.is_some() {
        parsed
            .events
            .push(InboundEvent::Closed(Some("server requested disconnect".to_string())));
    }

    if message.tool_call.is_some() {
        tracing::warn!("Ignoring tool call; no tools are configured");
    }

    Ok(parsed)
}
