//! OpenAI Chat Completions API provider.
//!
//! Streams chat completions via `/v1/chat/completions`. Serves both OpenAI
//! and OpenRouter, which speaks the same protocol plus attribution headers.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use parley_core::config::LlmConfig;
use parley_core::conversation::ConversationMessage;

use crate::sse::{SseEvent, parse_sse_stream};
use crate::{ChunkUsage, CompletionChunk, CompletionRequest, CompletionStream, Credentials, LlmProvider};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";

/// API flavour; OpenRouter adds attribution headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
}

/// Errors reported by the vendor rather than the transport.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("LLM API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("LLM stream error: {0}")]
    Stream(String),
}

pub struct OpenAiProvider {
    pub base_url: String,
    pub api_style: ApiStyle,
    referer: Option<String>,
    title: String,
    provider_id: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn openai(config: &LlmConfig) -> anyhow::Result<Self> {
        Self::build(config, ApiStyle::OpenAi, OPENAI_BASE_URL, "openai")
    }

    pub fn openrouter(config: &LlmConfig) -> anyhow::Result<Self> {
        Self::build(config, ApiStyle::OpenRouter, OPENROUTER_BASE_URL, "openrouter")
    }

    fn build(
        config: &LlmConfig,
        api_style: ApiStyle,
        default_base: &str,
        id: &str,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(default_base)
                .trim_end_matches('/')
                .to_string(),
            api_style,
            referer: config.referer.clone(),
            title: config.title.clone(),
            provider_id: id.into(),
            client,
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> OpenAiRequest {
        OpenAiRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            max_tokens: request.max_tokens,
            stream: true,
            temperature: request.temperature,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<ConversationMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.provider_id
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream> {
        let body = self.request_body(request);

        debug!(model = %body.model, base_url = %self.base_url, messages = body.messages.len(), "Streaming OpenAI-compatible API");

        let mut req_builder = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json");

        match credentials {
            Credentials::ApiKey { api_key } => {
                req_builder = req_builder.header("authorization", format!("Bearer {api_key}"));
            }
            Credentials::None if self.api_style == ApiStyle::OpenAi => {}
            Credentials::None => anyhow::bail!("OpenRouter requires an API key"),
        }
        if self.api_style == ApiStyle::OpenRouter {
            if let Some(referer) = &self.referer {
                req_builder = req_builder.header("HTTP-Referer", referer);
            }
            req_builder = req_builder.header("X-Title", &self.title);
        }

        let response = req_builder.json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status { status, body }.into());
        }

        Ok(Box::pin(chunk_stream(parse_sse_stream(response))))
    }
}

type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>;

/// Turn raw SSE events into completion chunks. Ends at `data: [DONE]`, at
/// the end of the body, or after the first error.
pub fn chunk_stream<S>(sse: S) -> impl Stream<Item = anyhow::Result<CompletionChunk>> + Send
where
    S: Stream<Item = anyhow::Result<SseEvent>> + Send + 'static,
{
    let sse: SseStream = Box::pin(sse);
    futures::stream::unfold(Some(sse), |state| async move {
        let mut sse = state?;
        loop {
            match sse.next().await {
                Some(Ok(sse_event)) => {
                    let data = sse_event.data.trim();

                    // OpenAI terminates with "data: [DONE]"
                    if data == "[DONE]" {
                        return None;
                    }

                    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                        Ok(c) => c,
                        Err(e) => {
                            trace!(%e, data, "Failed to parse OpenAI chunk");
                            continue;
                        }
                    };

                    // OpenRouter reports upstream failures inside the stream
                    if let Some(error) = chunk.error {
                        return Some((Err(CompletionError::Stream(error.message).into()), None));
                    }

                    if let Some(c) = to_completion_chunk(chunk) {
                        return Some((Ok(c), Some(sse)));
                    }
                }
                Some(Err(e)) => return Some((Err(e), None)),
                None => return None,
            }
        }
    })
}

fn to_completion_chunk(chunk: ChatCompletionChunk) -> Option<CompletionChunk> {
    // Usage (sent with stream_options.include_usage)
    let usage = chunk.usage.map(|u| ChunkUsage {
        input_tokens: Some(u.prompt_tokens),
        output_tokens: Some(u.completion_tokens),
    });

    let choice = chunk.choices.into_iter().next();
    let (delta, stop_reason) = match choice {
        Some(c) => (c.delta.content.filter(|s| !s.is_empty()), c.finish_reason),
        None => (None, None),
    };

    if delta.is_none() && usage.is_none() && stop_reason.is_none() {
        return None;
    }
    Some(CompletionChunk {
        delta,
        usage,
        stop_reason,
    })
}
