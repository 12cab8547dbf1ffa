//! Streaming speech-to-text over a vendor WebSocket.
//!
//! [`connect_stt`] opens the socket and spawns one pump task that owns it:
//! audio goes out in the order it was queued, transcript messages come back
//! as [`SttEvent`]s on the caller's channel.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use base64::Engine;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::config::{SttConfig, SttVendor};

/// Wrap raw 16-bit little-endian PCM bytes in a WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;

    let mut wav = Vec::with_capacity(44 + pcm.len());

    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);

    wav
}

#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    Transcript {
        text: String,
        is_final: bool,
        /// The vendor message as received, forwarded to the client.
        raw: serde_json::Value,
    },
    /// The vendor reported an error on an open connection.
    Error(String),
    /// The connection ended. `graceful` is true after a requested finish.
    Closed { graceful: bool, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttCommand {
    Audio(Bytes),
    /// Flush pending audio and ask the vendor to finish the stream.
    Finish,
}

/// Handle to a connected STT stream. Dropping it closes the socket.
#[derive(Debug)]
pub struct SttLink {
    commands: mpsc::UnboundedSender<SttCommand>,
    cancel: CancellationToken,
    finish_ends_stream: bool,
    finished: AtomicBool,
}

impl SttLink {
    /// A link whose finish ends the vendor stream.
    pub fn new(commands: mpsc::UnboundedSender<SttCommand>, cancel: CancellationToken) -> Self {
        Self {
            commands,
            cancel,
            finish_ends_stream: true,
            finished: AtomicBool::new(false),
        }
    }

    /// Finish only flushes; the stream keeps taking audio afterwards.
    pub fn finish_keeps_stream_open(mut self) -> Self {
        self.finish_ends_stream = false;
        self
    }

    /// Queue audio. Returns false once the stream is finishing or gone, so
    /// the caller can hold the audio for the next stream.
    pub fn send_audio(&self, pcm: Bytes) -> bool {
        if !self.accepts_audio() {
            return false;
        }
        self.commands.send(SttCommand::Audio(pcm)).is_ok()
    }

    pub fn accepts_audio(&self) -> bool {
        !self.finished.load(Ordering::Acquire) && !self.commands.is_closed()
    }

    /// Send the end-of-stream sentinel after any queued audio.
    pub fn finish(&self) {
        if self.finish_ends_stream {
            self.finished.store(true, Ordering::Release);
        }
        let _ = self.commands.send(SttCommand::Finish);
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SttLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn default_base_url(vendor: SttVendor) -> &'static str {
    match vendor {
        SttVendor::Cartesia => "wss://api.cartesia.ai/stt/websocket",
        SttVendor::Sarvam => "wss://api.sarvam.ai/speech-to-text/ws",
    }
}

/// Build the vendor endpoint with its query parameters.
pub fn build_url(config: &SttConfig) -> Result<String> {
    let base = config
        .url
        .as_deref()
        .unwrap_or_else(|| default_base_url(config.vendor));
    let mut url = reqwest::Url::parse(base).with_context(|| format!("invalid STT url {base}"))?;
    {
        let mut query = url.query_pairs_mut();
        match config.vendor {
            SttVendor::Cartesia => {
                query
                    .append_pair("model", config.effective_model())
                    .append_pair("language", config.effective_language())
                    .append_pair("encoding", "pcm_s16le")
                    .append_pair("sample_rate", &config.sample_rate.to_string())
                    .append_pair("min_volume", &config.min_volume.to_string())
                    .append_pair(
                        "max_silence_duration_secs",
                        &config.max_silence_duration_secs.to_string(),
                    );
            }
            SttVendor::Sarvam => {
                query
                    .append_pair("language-code", config.effective_language())
                    .append_pair("model", config.effective_model())
                    .append_pair(
                        "high_vad_sensitivity",
                        if config.high_vad_sensitivity { "true" } else { "false" },
                    );
            }
        }
    }
    Ok(url.to_string())
}

/// Build the handshake request, with the vendor's auth headers.
pub fn build_request(config: &SttConfig, api_key: &str) -> Result<Request> {
    let url = build_url(config)?;
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    match config.vendor {
        SttVendor::Cartesia => {
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {api_key}"))?,
            );
            headers.insert(
                "Cartesia-Version",
                HeaderValue::from_str(config.effective_version())?,
            );
        }
        SttVendor::Sarvam => {
            headers.insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_str(&format!("api-subscription-key.{api_key}"))?,
            );
        }
    }
    Ok(request)
}

/// Encode one PCM chunk the way the vendor expects it.
pub fn encode_audio(vendor: SttVendor, pcm: &[u8], sample_rate: u32) -> Message {
    match vendor {
        SttVendor::Cartesia => Message::Binary(Bytes::copy_from_slice(pcm)),
        SttVendor::Sarvam => {
            let wav = pcm_to_wav(pcm, sample_rate, 1, 16);
            let payload = serde_json::json!({
                "audio": {
                    "data": base64::engine::general_purpose::STANDARD.encode(wav),
                    "encoding": "audio/wav",
                    "sample_rate": sample_rate,
                }
            });
            Message::Text(payload.to_string().into())
        }
    }
}

/// Cartesia closes the stream after `done`; Sarvam's flush only forces
/// out pending transcripts.
fn finish_ends_stream(vendor: SttVendor) -> bool {
    matches!(vendor, SttVendor::Cartesia)
}

fn finish_message(vendor: SttVendor) -> Option<Message> {
    match vendor {
        SttVendor::Cartesia => Some(Message::Text("done".into())),
        SttVendor::Sarvam => Some(Message::Text(r#"{"type":"flush"}"#.into())),
    }
}

/// Translate one vendor text message. `None` means nothing the session cares about.
pub fn parse_message(vendor: SttVendor, text: &str) -> Option<SttEvent> {
    let raw: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!(vendor = vendor_label(vendor), error = %e, "Unparseable STT message");
            return None;
        }
    };
    let kind = raw
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    match (vendor, kind.as_str()) {
        (SttVendor::Cartesia, "transcript") => {
            let text = raw.get("text").and_then(|t| t.as_str()).unwrap_or_default().to_string();
            let is_final = raw.get("is_final").and_then(|f| f.as_bool()).unwrap_or(false);
            Some(SttEvent::Transcript { text, is_final, raw })
        }
        (SttVendor::Cartesia, "done") => Some(SttEvent::Closed {
            graceful: true,
            reason: "done".into(),
        }),
        (SttVendor::Cartesia, "flush_done") => None,
        (SttVendor::Cartesia, "error") => Some(SttEvent::Error(
            raw.get("message")
                .or_else(|| raw.get("error"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown STT error")
                .to_string(),
        )),
        (SttVendor::Sarvam, "data") => {
            let text = raw
                .pointer("/data/transcript")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string();
            Some(SttEvent::Transcript {
                text,
                is_final: true,
                raw,
            })
        }
        (SttVendor::Sarvam, "error") => Some(SttEvent::Error(
            raw.pointer("/data/message")
                .or_else(|| raw.pointer("/data/error"))
                .and_then(|m| m.as_str())
                .unwrap_or("unknown STT error")
                .to_string(),
        )),
        _ => {
            debug!(vendor = vendor_label(vendor), kind = %kind, "Ignoring STT message");
            None
        }
    }
}

fn vendor_label(vendor: SttVendor) -> &'static str {
    match vendor {
        SttVendor::Cartesia => "cartesia",
        SttVendor::Sarvam => "sarvam",
    }
}

/// Connect to the configured STT vendor and start pumping.
///
/// Fails if no API key is configured, the handshake fails, or it does not
/// complete within `connect_timeout_ms`.
pub async fn connect_stt(
    config: &SttConfig,
    events: mpsc::UnboundedSender<SttEvent>,
) -> Result<SttLink> {
    let api_key = config
        .resolve_api_key()
        .ok_or_else(|| anyhow::anyhow!("No STT API key configured"))?;
    let request = build_request(config, &api_key)?;

    let (ws_stream, _) = tokio::time::timeout(config.connect_timeout(), connect_async(request))
        .await
        .map_err(|_| anyhow::anyhow!("STT connect timed out after {}ms", config.connect_timeout_ms))?
        .context("STT connect failed")?;

    info!(vendor = vendor_label(config.vendor), "Connected to STT");

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    tokio::spawn(pump(
        config.vendor,
        config.sample_rate,
        ws_stream,
        commands_rx,
        cancel.clone(),
        events,
    ));
    let link = SttLink::new(commands_tx, cancel);
    if finish_ends_stream(config.vendor) {
        Ok(link)
    } else {
        Ok(link.finish_keeps_stream_open())
    }
}

async fn pump<S>(
    vendor: SttVendor,
    sample_rate: u32,
    ws_stream: S,
    mut commands: mpsc::UnboundedReceiver<SttCommand>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SttEvent>,
) where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws_stream.split();
    let mut finishing = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            command = commands.recv(), if !finishing => match command {
                Some(SttCommand::Audio(pcm)) => {
                    if let Err(e) = sink.send(encode_audio(vendor, &pcm, sample_rate)).await {
                        let _ = events.send(SttEvent::Closed {
                            graceful: false,
                            reason: format!("send failed: {e}"),
                        });
                        break;
                    }
                }
                Some(SttCommand::Finish) => {
                    finishing = finish_ends_stream(vendor);
                    if let Some(message) = finish_message(vendor) {
                        if let Err(e) = sink.send(message).await {
                            warn!(error = %e, "Failed to send STT finish");
                        }
                    }
                }
                None => break,
            },

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_message(vendor, &text) {
                        let closed = matches!(event, SttEvent::Closed { .. });
                        if events.send(event).is_err() || closed {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                    let _ = events.send(SttEvent::Closed { graceful: finishing, reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(SttEvent::Closed {
                        graceful: false,
                        reason: e.to_string(),
                    });
                    break;
                }
                None => {
                    let _ = events.send(SttEvent::Closed {
                        graceful: finishing,
                        reason: "stream ended".into(),
                    });
                    break;
                }
            },
        }
    }

    debug!(vendor = vendor_label(vendor), "STT pump stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    fn local_config(vendor: SttVendor, addr: std::net::SocketAddr) -> SttConfig {
        SttConfig {
            vendor,
            url: Some(format!("ws://{addr}/stt")),
            api_key: Some("test-key".into()),
            connect_timeout_ms: 2_000,
            ..SttConfig::default()
        }
    }

    #[test]
    fn test_wav_header_generation() {
        let pcm = vec![0u8; 32_000]; // 1 second at 16kHz
        let wav = pcm_to_wav(&pcm, 16_000, 1, 16);
        assert_eq!(wav.len(), 44 + 32_000);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[36..40], b"data");
        let sr = u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]);
        assert_eq!(sr, 16_000);
    }

    #[test]
    fn test_cartesia_url() {
        let url = build_url(&SttConfig::default()).unwrap();
        assert!(url.starts_with("wss://api.cartesia.ai/stt/websocket?"));
        assert!(url.contains("model=ink-whisper"));
        assert!(url.contains("encoding=pcm_s16le"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("min_volume=0.5"));
        assert!(url.contains("max_silence_duration_secs=1"));
    }

    #[test]
    fn test_sarvam_url_and_subprotocol() {
        let config = SttConfig {
            vendor: SttVendor::Sarvam,
            ..SttConfig::default()
        };
        let url = build_url(&config).unwrap();
        assert!(url.starts_with("wss://api.sarvam.ai/speech-to-text/ws?"));
        assert!(url.contains("language-code=unknown"));
        assert!(url.contains("high_vad_sensitivity=false"));

        let request = build_request(&config, "abc").unwrap();
        assert_eq!(
            request.headers().get("Sec-WebSocket-Protocol").unwrap(),
            "api-subscription-key.abc"
        );
    }

    #[test]
    fn test_cartesia_auth_headers() {
        let request = build_request(&SttConfig::default(), "k1").unwrap();
        assert_eq!(request.headers().get("Authorization").unwrap(), "Bearer k1");
        assert_eq!(request.headers().get("Cartesia-Version").unwrap(), "2025-04-16");
    }

    #[test]
    fn test_parse_cartesia_messages() {
        let partial = parse_message(
            SttVendor::Cartesia,
            r#"{"type":"transcript","text":"hel","is_final":false}"#,
        );
        assert!(matches!(
            partial,
            Some(SttEvent::Transcript { ref text, is_final: false, .. }) if text == "hel"
        ));
        assert!(matches!(
            parse_message(SttVendor::Cartesia, r#"{"type":"done"}"#),
            Some(SttEvent::Closed { graceful: true, .. })
        ));
        assert_eq!(
            parse_message(SttVendor::Cartesia, r#"{"type":"error","message":"quota"}"#),
            Some(SttEvent::Error("quota".into()))
        );
        assert_eq!(parse_message(SttVendor::Cartesia, r#"{"type":"flush_done"}"#), None);
        assert_eq!(parse_message(SttVendor::Cartesia, "not json"), None);
    }

    #[test]
    fn test_parse_sarvam_messages() {
        let event = parse_message(
            SttVendor::Sarvam,
            r#"{"type":"data","data":{"transcript":"namaste","language_code":"hi-IN"}}"#,
        );
        match event {
            Some(SttEvent::Transcript { text, is_final, raw }) => {
                assert_eq!(text, "namaste");
                assert!(is_final);
                assert_eq!(raw["data"]["language_code"], "hi-IN");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parse_message(SttVendor::Sarvam, r#"{"type":"events","data":{}}"#), None);
    }

    #[test]
    fn test_sarvam_audio_is_base64_wav_json() {
        let message = encode_audio(SttVendor::Sarvam, &[1, 0, 2, 0], 16_000);
        let Message::Text(text) = message else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["audio"]["encoding"], "audio/wav");
        let wav = base64::engine::general_purpose::STANDARD
            .decode(value["audio"]["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[44..], &[1, 0, 2, 0]);
    }

    #[tokio::test]
    async fn test_connect_requires_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::remove_var("CARTESIA_API_KEY") };
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = connect_stt(&SttConfig::default(), tx).await.unwrap_err();
        assert!(err.to_string().contains("API key"));
    }

    #[tokio::test]
    async fn test_connect_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let config = SttConfig {
            connect_timeout_ms: 100,
            ..local_config(SttVendor::Cartesia, addr)
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = connect_stt(&config, tx).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_streams_audio_in_order_and_finishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let mut received = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Binary(data) => {
                        received.push(data.to_vec());
                        if received.len() == 3 {
                            ws.send(Message::Text(
                                r#"{"type":"transcript","text":"hello","is_final":true}"#.into(),
                            ))
                            .await
                            .unwrap();
                        }
                    }
                    Message::Text(text) if text.as_str() == "done" => {
                        ws.send(Message::Text(r#"{"type":"done"}"#.into())).await.unwrap();
                        break;
                    }
                    _ => {}
                }
            }
            received
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = connect_stt(&local_config(SttVendor::Cartesia, addr), tx)
            .await
            .unwrap();
        for i in 0..3u8 {
            assert!(link.send_audio(Bytes::from(vec![i; 8])));
        }
        link.finish();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(
            first,
            Some(SttEvent::Transcript { ref text, is_final: true, .. }) if text == "hello"
        ));
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(second, Some(SttEvent::Closed { graceful: true, .. })));

        let received = server.await.unwrap();
        assert_eq!(received, vec![vec![0u8; 8], vec![1u8; 8], vec![2u8; 8]]);
    }

    #[tokio::test]
    async fn test_server_drop_reports_ungraceful_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            drop(ws);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _link = connect_stt(&local_config(SttVendor::Cartesia, addr), tx)
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(event, Some(SttEvent::Closed { graceful: false, .. })));
    }

    #[tokio::test]
    async fn test_cartesia_refuses_audio_once_finishing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let mut audio = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    Message::Binary(data) => audio.push(data.to_vec()),
                    Message::Text(text) if text.as_str() == "done" => {
                        ws.send(Message::Text(r#"{"type":"done"}"#.into())).await.unwrap();
                        break;
                    }
                    _ => {}
                }
            }
            audio
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = connect_stt(&local_config(SttVendor::Cartesia, addr), tx)
            .await
            .unwrap();
        assert!(link.send_audio(Bytes::from(vec![1u8; 4])));
        link.finish();
        assert!(!link.accepts_audio());
        assert!(!link.send_audio(Bytes::from(vec![2u8; 4])));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(matches!(event, Some(SttEvent::Closed { graceful: true, .. })));
        assert_eq!(server.await.unwrap(), vec![vec![1u8; 4]]);
    }

    #[tokio::test]
    async fn test_sarvam_keeps_streaming_after_flush() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            let mut kinds = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Text(text) = message {
                    let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                    let kind = if value.get("audio").is_some() { "audio" } else { "flush" };
                    kinds.push(kind);
                    if kinds.len() == 3 {
                        break;
                    }
                }
            }
            kinds
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let link = connect_stt(&local_config(SttVendor::Sarvam, addr), tx)
            .await
            .unwrap();
        assert!(link.send_audio(Bytes::from(vec![1u8; 4])));
        link.finish();
        assert!(link.accepts_audio());
        assert!(link.send_audio(Bytes::from(vec![2u8; 4])));

        let kinds = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kinds, vec!["audio", "flush", "audio"]);
    }
}
