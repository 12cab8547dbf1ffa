//! Assistant profile: the resolved system prompt and config a new session starts with.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::{Config, KnowledgeConfig};
use crate::error::{ParleyError, Result};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Your replies are \
spoken aloud, so keep them short and conversational and avoid lists, markdown and emoji. \
Use the knowledge base below when it answers the caller's question.\n\n{knowledge}";

/// Immutable snapshot handed to every session at creation.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub config: Arc<Config>,
    pub system_prompt: Arc<str>,
    pub loaded_at: DateTime<Utc>,
}

impl SessionProfile {
    /// Profile without any knowledge lookup. Useful for tests and offline runs.
    pub fn from_config(config: Config) -> Self {
        let knowledge = config
            .assistant
            .as_ref()
            .and_then(|a| a.knowledge.as_ref())
            .and_then(|k| k.inline.as_ref())
            .map(render_knowledge);
        Self::with_knowledge(config, knowledge.as_deref())
    }

    pub fn with_knowledge(config: Config, knowledge: Option<&str>) -> Self {
        let template = config
            .assistant
            .as_ref()
            .and_then(|a| a.system_prompt.as_deref());
        let system_prompt = build_system_prompt(template, knowledge);
        Self {
            config: Arc::new(config),
            system_prompt: Arc::from(system_prompt),
            loaded_at: Utc::now(),
        }
    }

    /// Resolve the configured knowledge source and build the profile.
    pub async fn load(config: Config, client: &reqwest::Client) -> Result<Self> {
        let knowledge = match config.assistant.as_ref().and_then(|a| a.knowledge.as_ref()) {
            Some(source) => Some(load_knowledge(source, client).await?),
            None => None,
        };
        Ok(Self::with_knowledge(config, knowledge.as_deref()))
    }
}

/// Fill the `{knowledge}` placeholder, or append the knowledge when the template has none.
pub fn build_system_prompt(template: Option<&str>, knowledge: Option<&str>) -> String {
    let template = template.unwrap_or(DEFAULT_SYSTEM_PROMPT);
    let knowledge = knowledge.map(str::trim).filter(|k| !k.is_empty());
    if template.contains("{knowledge}") {
        let section = knowledge
            .map(|k| format!("Knowledge base:\n{k}"))
            .unwrap_or_default();
        return template.replace("{knowledge}", &section).trim_end().to_string();
    }
    match knowledge {
        Some(k) => format!("{}\n\nKnowledge base:\n{k}", template.trim_end()),
        None => template.to_string(),
    }
}

/// Render structured knowledge for inclusion in a prompt.
pub fn render_knowledge(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Load knowledge text from whichever source is configured.
pub async fn load_knowledge(source: &KnowledgeConfig, client: &reqwest::Client) -> Result<String> {
    if let Some(inline) = &source.inline {
        return Ok(render_knowledge(inline));
    }
    if let Some(file) = &source.file {
        let expanded = shellexpand::tilde(file);
        return load_knowledge_file(Path::new(expanded.as_ref())).await;
    }
    if let Some(url) = &source.url {
        return fetch_knowledge(url, source.resolve_token().as_deref(), client).await;
    }
    Err(ParleyError::Config(
        "assistant.knowledge has no source configured".into(),
    ))
}

async fn load_knowledge_file(path: &Path) -> Result<String> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(render_text(&raw))
}

async fn fetch_knowledge(url: &str, token: Option<&str>, client: &reqwest::Client) -> Result<String> {
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .map_err(|e| ParleyError::Config(format!("knowledge fetch failed: {e}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ParleyError::Config(format!(
            "knowledge fetch returned HTTP {status}"
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|e| ParleyError::Config(format!("knowledge body unreadable: {e}")))?;
    tracing::debug!(url, bytes = body.len(), "Fetched knowledge base");
    Ok(render_text(&body))
}

/// JSON bodies are pretty-printed; anything else is used verbatim.
fn render_text(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => render_knowledge(&value),
        Err(_) => raw.trim().to_string(),
    }
}
