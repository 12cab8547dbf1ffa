//! Client wire protocol.
//!
//! Binary frames from the client carry container audio. Text frames carry
//! either a control message, a base64 PCM audio message, or the bare string
//! `stop-recording`. Everything the server sends is a JSON [`ServerEvent`]
//! except the optional raw audio echo.

use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ParleyError, Result};
use crate::types::{AudioEncoding, AudioFrame, strip_wav_header};
use crate::usage::{UsageCost, UsageSnapshot};

/// Control messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientControl {
    /// End of the utterance stream: drain the transcoder and finalize STT.
    StopRecording,
    /// Ask for a `usage` event.
    GetUsage,
    /// Zero the usage counters.
    ResetUsage,
}

#[derive(Debug, Clone, Deserialize)]
struct AudioPayload {
    data: String,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    sample_rate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct AudioEnvelope {
    audio: AudioPayload,
}

/// A decoded client text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Control(ClientControl),
    Audio(AudioFrame),
}

impl ClientMessage {
    /// Parse a client text frame.
    pub fn parse_text(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed == "stop-recording" {
            return Ok(ClientMessage::Control(ClientControl::StopRecording));
        }

        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| ParleyError::Validation(format!("unparseable client message: {e}")))?;

        if value.get("type").is_some() {
            let control: ClientControl = serde_json::from_value(value)
                .map_err(|e| ParleyError::Validation(format!("unknown control message: {e}")))?;
            return Ok(ClientMessage::Control(control));
        }

        if value.get("audio").is_some() {
            let envelope: AudioEnvelope = serde_json::from_value(value)
                .map_err(|e| ParleyError::Validation(format!("bad audio message: {e}")))?;
            return envelope.into_frame().map(ClientMessage::Audio);
        }

        Err(ParleyError::Validation(
            "client message has neither `type` nor `audio`".into(),
        ))
    }
}

impl AudioEnvelope {
    fn into_frame(self) -> Result<AudioFrame> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(self.audio.data.as_bytes())
            .map_err(|e| ParleyError::Validation(format!("audio data is not base64: {e}")))?;
        let encoding = self
            .audio
            .encoding
            .as_deref()
            .map(AudioEncoding::from_label)
            .unwrap_or(AudioEncoding::Pcm16);
        let data = match encoding {
            AudioEncoding::Pcm16 => strip_wav_header(Bytes::from(raw)),
            AudioEncoding::Container(_) => Bytes::from(raw),
        };
        Ok(AudioFrame {
            data,
            encoding,
            sample_rate: self.audio.sample_rate,
        })
    }
}

/// Events pushed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status {
        message: String,
    },
    /// A vendor transcript message, forwarded as received.
    Transcription {
        transcription: serde_json::Value,
    },
    AiStream {
        text: String,
    },
    AiDone,
    AiAudio {
        /// Base64 audio bytes in the TTS output format.
        audio: String,
        context_id: String,
    },
    TokenUsage {
        input_tokens: u64,
        input_words: u64,
    },
    TokenUsageFinal {
        output_tokens: u64,
        output_words: u64,
        total_tokens: u64,
    },
    AiError {
        text: String,
    },
    Warning {
        text: String,
    },
    Usage {
        #[serde(flatten)]
        usage: UsageSnapshot,
        cost: UsageCost,
    },
}

impl ServerEvent {
    pub fn ai_audio(audio: &[u8], context_id: impl Into<String>) -> Self {
        ServerEvent::AiAudio {
            audio: base64::engine::general_purpose::STANDARD.encode(audio),
            context_id: context_id.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
