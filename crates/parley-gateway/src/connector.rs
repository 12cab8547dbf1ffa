//! The seam between a session and the outside world.
//!
//! A [`Session`](crate::session::Session) never talks to vendors directly: it
//! asks a [`Connector`] for links. [`LiveConnector`] opens real sockets,
//! requests and decoder processes; tests supply scripted fakes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_core::config::{LlmConfig, SttConfig, TranscoderConfig, TtsConfig};
use parley_core::conversation::ConversationMessage;
use parley_media::stt::{self, SttEvent, SttLink};
use parley_media::transcoder::{self, InputFormat, TranscoderEvent, TranscoderLink};
use parley_media::tts_stream::{self, TtsEvent, TtsLink};
use parley_providers::{CompletionRequest, CompletionStream, Credentials, provider_for};

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a streaming STT connection. Events for it arrive on `events`.
    async fn connect_stt(
        &self,
        config: &SttConfig,
        events: mpsc::UnboundedSender<SttEvent>,
    ) -> anyhow::Result<SttLink>;

    /// Open a TTS transport. Events for every context arrive on `events`.
    async fn connect_tts(
        &self,
        config: &TtsConfig,
        events: mpsc::UnboundedSender<TtsEvent>,
    ) -> anyhow::Result<TtsLink>;

    /// Start streaming a reply for the full ordered history.
    async fn stream_reply(
        &self,
        config: &LlmConfig,
        messages: Vec<ConversationMessage>,
    ) -> anyhow::Result<CompletionStream>;

    /// Start a decoder producing mono PCM at `output_rate`.
    fn spawn_transcoder(
        &self,
        config: &TranscoderConfig,
        format: &InputFormat,
        output_rate: u32,
        events: mpsc::UnboundedSender<TranscoderEvent>,
    ) -> anyhow::Result<TranscoderLink>;
}

/// Connects to the configured vendors and runs the configured decoder.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveConnector;

#[async_trait]
impl Connector for LiveConnector {
    async fn connect_stt(
        &self,
        config: &SttConfig,
        events: mpsc::UnboundedSender<SttEvent>,
    ) -> anyhow::Result<SttLink> {
        stt::connect_stt(config, events).await
    }

    async fn connect_tts(
        &self,
        config: &TtsConfig,
        events: mpsc::UnboundedSender<TtsEvent>,
    ) -> anyhow::Result<TtsLink> {
        tts_stream::connect_tts(config, events).await
    }

    async fn stream_reply(
        &self,
        config: &LlmConfig,
        messages: Vec<ConversationMessage>,
    ) -> anyhow::Result<CompletionStream> {
        let provider = provider_for(config)?;
        let request = CompletionRequest::from_config(config, messages);
        provider.stream(&request, &Credentials::from_config(config)).await
    }

    fn spawn_transcoder(
        &self,
        config: &TranscoderConfig,
        format: &InputFormat,
        output_rate: u32,
        events: mpsc::UnboundedSender<TranscoderEvent>,
    ) -> anyhow::Result<TranscoderLink> {
        transcoder::spawn_ffmpeg(config, format, output_rate, events)
    }
}
