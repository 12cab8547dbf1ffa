//! Streaming TTS: text buffers go out tagged with a context id, audio chunks
//! come back tagged with the same id as soon as the vendor produces them.
//!
//! Two transports share one handle type: a duplex WebSocket multiplexed by
//! context id, and one streamed HTTP request per text buffer.

use std::collections::HashSet;

use anyhow::{Context, Result};
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::config::{TtsConfig, TtsMode};

/// One text buffer for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsRequest {
    pub transcript: String,
    pub context_id: String,
    /// More text follows for this context.
    pub continue_: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsCommand {
    Speak(TtsRequest),
    /// Stop synthesizing a context; late chunks may still arrive.
    Cancel { context_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsEvent {
    Chunk { context_id: String, audio: Bytes },
    /// The vendor finished every buffer sent for this context.
    Done { context_id: String },
    Error {
        context_id: Option<String>,
        message: String,
    },
    /// The transport went away.
    Closed { reason: String },
}

/// Handle to a TTS transport. Dropping it closes the transport.
#[derive(Debug)]
pub struct TtsLink {
    commands: mpsc::UnboundedSender<TtsCommand>,
    cancel: CancellationToken,
}

impl TtsLink {
    pub fn new(commands: mpsc::UnboundedSender<TtsCommand>, cancel: CancellationToken) -> Self {
        Self { commands, cancel }
    }

    pub fn speak(&self, request: TtsRequest) -> bool {
        self.commands.send(TtsCommand::Speak(request)).is_ok()
    }

    pub fn cancel_context(&self, context_id: &str) {
        let _ = self.commands.send(TtsCommand::Cancel {
            context_id: context_id.to_string(),
        });
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TtsLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn voice_and_format(config: &TtsConfig) -> (serde_json::Value, serde_json::Value) {
    (
        serde_json::json!({ "mode": "id", "id": config.voice }),
        serde_json::json!({
            "container": config.effective_container(),
            "encoding": config.encoding,
            "sample_rate": config.sample_rate,
        }),
    )
}

/// Socket message asking for synthesis of one buffer.
pub fn speak_message(config: &TtsConfig, request: &TtsRequest) -> serde_json::Value {
    let (voice, output_format) = voice_and_format(config);
    serde_json::json!({
        "model_id": config.model,
        "transcript": request.transcript,
        "voice": voice,
        "language": config.language,
        "context_id": request.context_id,
        "output_format": output_format,
        "continue": request.continue_,
    })
}

pub fn cancel_message(context_id: &str) -> serde_json::Value {
    serde_json::json!({ "context_id": context_id, "cancel": true })
}

/// Translate one socket message. `None` for messages the session ignores.
pub fn parse_message(text: &str) -> Option<TtsEvent> {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Unparseable TTS message");
            return None;
        }
    };
    let context_id = raw
        .get("context_id")
        .and_then(|c| c.as_str())
        .map(str::to_string);
    match raw.get("type").and_then(|t| t.as_str()) {
        Some("chunk") => {
            let data = raw.get("data").and_then(|d| d.as_str())?;
            let audio = match base64::engine::general_purpose::STANDARD.decode(data) {
                Ok(audio) => audio,
                Err(e) => {
                    warn!(error = %e, "TTS chunk is not valid base64");
                    return None;
                }
            };
            Some(TtsEvent::Chunk {
                context_id: context_id.unwrap_or_default(),
                audio: Bytes::from(audio),
            })
        }
        Some("done") => Some(TtsEvent::Done {
            context_id: context_id.unwrap_or_default(),
        }),
        Some("error") => Some(TtsEvent::Error {
            context_id,
            message: raw
                .get("error")
                .or_else(|| raw.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown TTS error")
                .to_string(),
        }),
        other => {
            debug!(kind = ?other, "Ignoring TTS message");
            None
        }
    }
}

/// Open the configured TTS transport.
pub async fn connect_tts(config: &TtsConfig, events: mpsc::UnboundedSender<TtsEvent>) -> Result<TtsLink> {
    let api_key = config
        .resolve_api_key()
        .ok_or_else(|| anyhow::anyhow!("No TTS API key configured"))?;
    match config.mode {
        TtsMode::Websocket => connect_socket(config, api_key, events).await,
        TtsMode::Http => Ok(start_http(config.clone(), api_key, events)),
    }
}

async fn connect_socket(
    config: &TtsConfig,
    api_key: String,
    events: mpsc::UnboundedSender<TtsEvent>,
) -> Result<TtsLink> {
    let mut request = config.effective_url().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert("X-API-Key", HeaderValue::from_str(&api_key)?);
    headers.insert("Cartesia-Version", HeaderValue::from_str(&config.version)?);

    let (ws_stream, _) = tokio::time::timeout(config.connect_timeout(), connect_async(request))
        .await
        .map_err(|_| anyhow::anyhow!("TTS connect timed out after {}ms", config.connect_timeout_ms))?
        .context("TTS connect failed")?;
    info!(url = config.effective_url(), "Connected to TTS");

    let (commands_tx, mut commands) = mpsc::unbounded_channel::<TtsCommand>();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let config = config.clone();

    tokio::spawn(async move {
        let (mut sink, mut stream) = ws_stream.split();
        loop {
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }

                command = commands.recv() => {
                    let payload = match command {
                        Some(TtsCommand::Speak(request)) => speak_message(&config, &request),
                        Some(TtsCommand::Cancel { context_id }) => cancel_message(&context_id),
                        None => break,
                    };
                    if let Err(e) = sink.send(Message::Text(payload.to_string().into())).await {
                        let _ = events.send(TtsEvent::Closed { reason: format!("send failed: {e}") });
                        break;
                    }
                }

                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = parse_message(&text) {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = events.send(TtsEvent::Closed { reason: "socket closed".into() });
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(TtsEvent::Closed { reason: e.to_string() });
                        break;
                    }
                },
            }
        }
        debug!("TTS socket task stopped");
    });

    Ok(TtsLink::new(commands_tx, cancel))
}

/// HTTP transport: requests are served one at a time, in order.
/// Contexts whose remaining buffers are not synthesized: cancelled by the
/// session, or failed on an earlier buffer.
#[derive(Debug, Default)]
struct SkippedContexts(HashSet<String>);

impl SkippedContexts {
    fn insert(&mut self, context_id: String) {
        self.0.insert(context_id);
    }

    /// Whether to skip `request`. A context is forgotten at its final buffer.
    fn skip(&mut self, request: &TtsRequest) -> bool {
        if !self.0.contains(&request.context_id) {
            return false;
        }
        if !request.continue_ {
            self.0.remove(&request.context_id);
        }
        true
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

fn start_http(config: TtsConfig, api_key: String, events: mpsc::UnboundedSender<TtsEvent>) -> TtsLink {
    let (commands_tx, mut commands) = mpsc::unbounded_channel::<TtsCommand>();
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let mut skipped = SkippedContexts::default();
        loop {
            let command = tokio::select! {
                _ = task_cancel.cancelled() => break,
                command = commands.recv() => command,
            };
            let request = match command {
                Some(TtsCommand::Speak(request)) => request,
                Some(TtsCommand::Cancel { context_id }) => {
                    skipped.insert(context_id);
                    continue;
                }
                None => break,
            };
            if skipped.skip(&request) {
                debug!(context_id = %request.context_id, skipped = skipped.len(), "Skipping TTS buffer");
                continue;
            }

            if !request.transcript.trim().is_empty() {
                let streamed = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    result = stream_tts(&client, &config, &api_key, &request, &events) => result,
                };
                if let Err(e) = streamed {
                    if request.continue_ {
                        skipped.insert(request.context_id.clone());
                    }
                    let _ = events.send(TtsEvent::Error {
                        context_id: Some(request.context_id),
                        message: e.to_string(),
                    });
                    continue;
                }
            }
            if !request.continue_ {
                let _ = events.send(TtsEvent::Done {
                    context_id: request.context_id,
                });
            }
        }
        debug!("TTS http task stopped");
    });

    TtsLink::new(commands_tx, cancel)
}

/// Stream one buffer over HTTP, forwarding body chunks as they arrive.
pub async fn stream_tts(
    client: &reqwest::Client,
    config: &TtsConfig,
    api_key: &str,
    request: &TtsRequest,
    events: &mpsc::UnboundedSender<TtsEvent>,
) -> Result<()> {
    let (voice, output_format) = voice_and_format(config);
    debug!(
        context_id = %request.context_id,
        text_len = request.transcript.len(),
        "Starting TTS stream"
    );

    let resp = client
        .post(config.effective_url())
        .header("X-API-Key", api_key)
        .header("Cartesia-Version", &config.version)
        .json(&serde_json::json!({
            "model_id": config.model,
            "transcript": request.transcript,
            "voice": voice,
            "language": config.language,
            "output_format": output_format,
        }))
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("TTS API error {status}: {body}");
    }

    let mut stream = resp.bytes_stream();
    while let Some(chunk_result) = stream.next().await {
        match chunk_result {
            Ok(bytes) if bytes.is_empty() => {}
            Ok(bytes) => {
                let event = TtsEvent::Chunk {
                    context_id: request.context_id.clone(),
                    audio: bytes,
                };
                if events.send(event).is_err() {
                    debug!("TTS event receiver dropped, stopping stream");
                    break;
                }
            }
            Err(e) => {
                anyhow::bail!("TTS stream error: {e}");
            }
        }
    }

    Ok(())
}
