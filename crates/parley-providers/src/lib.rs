//! LLM provider abstraction.
//!
//! Each provider implements the [`LlmProvider`] trait and streams chat
//! completion deltas for a full conversation history.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use parley_core::config::{LlmConfig, LlmProviderKind};
use parley_core::conversation::ConversationMessage;

pub mod openai;
pub mod sse;

pub use openai::OpenAiProvider;

/// Credentials for authenticating with an LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Credentials {
    #[serde(rename = "api_key")]
    ApiKey { api_key: String },
    /// For self-hosted OpenAI-compatible servers that accept no key.
    #[serde(rename = "none")]
    None,
}

impl Credentials {
    pub fn from_config(config: &LlmConfig) -> Self {
        match config.resolve_api_key() {
            Some(api_key) => Credentials::ApiKey { api_key },
            None => Credentials::None,
        }
    }
}

/// A request to the LLM. `messages` is the full ordered history, system
/// prompt first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ConversationMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn from_config(config: &LlmConfig, messages: Vec<ConversationMessage>) -> Self {
        Self {
            model: config.model.clone(),
            messages,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

/// A streamed chunk from the LLM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub delta: Option<String>,
    pub usage: Option<ChunkUsage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

pub type CompletionStream = Pin<Box<dyn Stream<Item = anyhow::Result<CompletionChunk>> + Send>>;

/// The core LLM provider trait.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g., "openrouter", "openai").
    fn id(&self) -> &str;

    /// Start a streaming completion. Errors before the first byte (connect,
    /// auth, HTTP status) are returned here; errors mid-stream arrive as
    /// `Err` items.
    async fn stream(
        &self,
        request: &CompletionRequest,
        credentials: &Credentials,
    ) -> anyhow::Result<CompletionStream>;
}

/// Build the provider selected by `llm.provider`.
pub fn provider_for(config: &LlmConfig) -> anyhow::Result<Box<dyn LlmProvider>> {
    let provider = match config.provider {
        LlmProviderKind::Openrouter => OpenAiProvider::openrouter(config)?,
        LlmProviderKind::Openai => OpenAiProvider::openai(config)?,
    };
    Ok(Box::new(provider))
}
