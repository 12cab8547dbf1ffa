//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::usage::UsageRates;

/// Top-level Parley configuration.
///
/// Every section is optional; accessors fall back to the section defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<SttConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcoder: Option<TranscoderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant: Option<AssistantConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

fn default_true() -> bool {
    true
}

// --- Gateway ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
}

fn default_port() -> u16 {
    8080
}

// --- Speech-to-text ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SttVendor {
    #[default]
    Cartesia,
    Sarvam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default)]
    pub vendor: SttVendor,

    /// Override the vendor WebSocket endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// API version header sent to vendors that require one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default = "default_stt_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_min_volume")]
    pub min_volume: f32,

    #[serde(default = "default_max_silence")]
    pub max_silence_duration_secs: f32,

    #[serde(default)]
    pub high_vad_sensitivity: bool,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Reconnect attempts after the connection drops before the session is failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_stt_sample_rate() -> u32 {
    16_000
}

fn default_min_volume() -> f32 {
    0.5
}

fn default_max_silence() -> f32 {
    1.0
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            vendor: SttVendor::default(),
            url: None,
            api_key: None,
            api_key_env: None,
            model: None,
            language: None,
            version: None,
            sample_rate: default_stt_sample_rate(),
            min_volume: default_min_volume(),
            max_silence_duration_secs: default_max_silence(),
            high_vad_sensitivity: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl SttConfig {
    /// Resolve the API key: direct value, then `api_key_env`, then the vendor's conventional variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        let fallback_env = Some(
            match self.vendor {
                SttVendor::Cartesia => "CARTESIA_API_KEY",
                SttVendor::Sarvam => "SARVAM_API_KEY",
            }
            .to_string(),
        );
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| resolve_secret_field(&None, &fallback_env))
    }

    pub fn effective_model(&self) -> &str {
        self.model.as_deref().unwrap_or(match self.vendor {
            SttVendor::Cartesia => "ink-whisper",
            SttVendor::Sarvam => "saarika:v2.5",
        })
    }

    pub fn effective_language(&self) -> &str {
        self.language.as_deref().unwrap_or(match self.vendor {
            SttVendor::Cartesia => "en",
            SttVendor::Sarvam => "unknown",
        })
    }

    pub fn effective_version(&self) -> &str {
        self.version.as_deref().unwrap_or("2025-04-16")
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based): exponential, capped at `backoff_max_ms`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

// --- LLM ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProviderKind {
    #[default]
    Openrouter,
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProviderKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Sent as `HTTP-Referer` to OpenRouter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,

    /// Sent as `X-Title` to OpenRouter.
    #[serde(default = "default_app_title")]
    pub title: String,

    #[serde(default = "default_llm_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_llm_model() -> String {
    "openai/gpt-4o".into()
}

fn default_app_title() -> String {
    "Voice Assistant".into()
}

fn default_llm_timeout_ms() -> u64 {
    15_000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::default(),
            base_url: None,
            api_key: None,
            api_key_env: None,
            model: default_llm_model(),
            max_tokens: None,
            temperature: None,
            referer: None,
            title: default_app_title(),
            connect_timeout_ms: default_llm_timeout_ms(),
        }
    }
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        let fallback_env = Some(
            match self.provider {
                LlmProviderKind::Openrouter => "OPENROUTER_API_KEY",
                LlmProviderKind::Openai => "OPENAI_API_KEY",
            }
            .to_string(),
        );
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| resolve_secret_field(&None, &fallback_env))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// --- Text-to-speech ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsMode {
    /// One duplex socket per session, multiplexed by context id.
    #[default]
    Websocket,
    /// One streamed HTTP request per text buffer.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub mode: TtsMode,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default = "default_tts_version")]
    pub version: String,

    #[serde(default = "default_tts_model")]
    pub model: String,

    #[serde(default = "default_tts_voice")]
    pub voice: String,

    #[serde(default = "default_tts_language")]
    pub language: String,

    /// Output container: "raw" for the socket, "wav" for HTTP.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    #[serde(default = "default_tts_encoding")]
    pub encoding: String,

    #[serde(default = "default_tts_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_tts_version() -> String {
    "2025-04-16".into()
}

fn default_tts_model() -> String {
    "sonic-3".into()
}

fn default_tts_voice() -> String {
    "694f9389-aac1-45b6-b726-9d9369183238".into()
}

fn default_tts_language() -> String {
    "en".into()
}

fn default_tts_encoding() -> String {
    "pcm_s16le".into()
}

fn default_tts_sample_rate() -> u32 {
    44_100
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            mode: TtsMode::default(),
            url: None,
            api_key: None,
            api_key_env: None,
            version: default_tts_version(),
            model: default_tts_model(),
            voice: default_tts_voice(),
            language: default_tts_language(),
            container: None,
            encoding: default_tts_encoding(),
            sample_rate: default_tts_sample_rate(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
            .or_else(|| resolve_secret_field(&None, &Some("CARTESIA_API_KEY".into())))
    }

    pub fn effective_url(&self) -> &str {
        self.url.as_deref().unwrap_or(match self.mode {
            TtsMode::Websocket => "wss://api.cartesia.ai/tts/websocket",
            TtsMode::Http => "https://api.cartesia.ai/tts/bytes",
        })
    }

    pub fn effective_container(&self) -> &str {
        self.container.as_deref().unwrap_or(match self.mode {
            TtsMode::Websocket => "raw",
            TtsMode::Http => "wav",
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// --- Transcoder ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Decoder binary (default: "ffmpeg" on PATH).
    #[serde(default = "default_transcoder_program")]
    pub program: String,

    /// Container format of binary client frames.
    #[serde(default = "default_input_format")]
    pub input_format: String,
}

fn default_transcoder_program() -> String {
    "ffmpeg".into()
}

fn default_input_format() -> String {
    "webm".into()
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: default_transcoder_program(),
            input_format: default_input_format(),
        }
    }
}

// --- Session ---

/// What to do with audio that arrives before the STT connection is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyAudioPolicy {
    #[default]
    Buffer,
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyAudioConfig {
    #[serde(default)]
    pub policy: EarlyAudioPolicy,

    /// Maximum buffered frames; the oldest is dropped on overflow.
    #[serde(default = "default_early_capacity")]
    pub capacity: usize,
}

fn default_early_capacity() -> usize {
    256
}

impl Default for EarlyAudioConfig {
    fn default() -> Self {
        Self {
            policy: EarlyAudioPolicy::default(),
            capacity: default_early_capacity(),
        }
    }
}

/// What to do with a final transcript that arrives while a turn is still open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOverlapPolicy {
    #[default]
    Queue,
    Reject,
    BargeIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Length threshold for the text chunker (default: 60 characters).
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,

    #[serde(default)]
    pub early_audio: EarlyAudioConfig,

    #[serde(default)]
    pub turn_overlap: TurnOverlapPolicy,

    /// Queued transcripts allowed behind the open turn under the `queue` policy.
    #[serde(default = "default_max_pending_turns")]
    pub max_pending_turns: usize,

    /// Echo inbound binary frames back to the client.
    #[serde(default)]
    pub echo_audio: bool,

    /// Send `status` events on connect.
    #[serde(default = "default_true")]
    pub status_events: bool,

    /// Directory for raw inbound audio captures (disabled when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_dir: Option<String>,

    /// Push a `usage` event every N seconds (disabled when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_report_interval_secs: Option<u64>,

    /// Fail the turn when TTS sends nothing for this long after the reply
    /// is complete (0 disables).
    #[serde(default = "default_synthesis_timeout_secs")]
    pub synthesis_timeout_secs: u64,
}

fn default_chunk_max_chars() -> usize {
    60
}

fn default_max_pending_turns() -> usize {
    2
}

fn default_synthesis_timeout_secs() -> u64 {
    30
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_max_chars: default_chunk_max_chars(),
            early_audio: EarlyAudioConfig::default(),
            turn_overlap: TurnOverlapPolicy::default(),
            max_pending_turns: default_max_pending_turns(),
            echo_audio: false,
            status_events: true,
            capture_dir: None,
            usage_report_interval_secs: None,
            synthesis_timeout_secs: default_synthesis_timeout_secs(),
        }
    }
}

impl SessionConfig {
    pub fn synthesis_timeout(&self) -> Option<Duration> {
        (self.synthesis_timeout_secs > 0).then(|| Duration::from_secs(self.synthesis_timeout_secs))
    }

    pub fn capture_path(&self) -> Option<PathBuf> {
        self.capture_dir.as_ref().map(|dir| {
            let expanded = shellexpand::tilde(dir);
            PathBuf::from(expanded.as_ref())
        })
    }
}

// --- Assistant ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// System prompt template; `{knowledge}` is replaced with the rendered knowledge base.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge: Option<KnowledgeConfig>,

    /// Re-fetch URL knowledge every N seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_secs: Option<u64>,
}

/// Where the assistant's knowledge base comes from. Exactly one source should be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl KnowledgeConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    fn source_count(&self) -> usize {
        [
            self.inline.is_some(),
            self.file.is_some(),
            self.url.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

// --- Usage ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default)]
    pub rates: UsageRates,
}

// --- Logging ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "parley_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret from a direct value or an environment variable name.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> crate::error::Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| crate::error::ParleyError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::from_json5(&raw)
    }

    /// Parse config text (after env substitution).
    pub fn from_json5(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| crate::error::ParleyError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(default_port())
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".into())
    }

    pub fn stt(&self) -> SttConfig {
        self.stt.clone().unwrap_or_default()
    }

    pub fn llm(&self) -> LlmConfig {
        self.llm.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn transcoder(&self) -> TranscoderConfig {
        self.transcoder.clone().unwrap_or_default()
    }

    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    pub fn usage_rates(&self) -> UsageRates {
        self.usage.as_ref().map(|u| u.rates.clone()).unwrap_or_default()
    }

    pub fn knowledge_refresh(&self) -> Option<Duration> {
        self.assistant
            .as_ref()
            .and_then(|a| a.refresh_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "stt.vendor").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.stt().resolve_api_key().is_none() {
            warnings.push("STT vendor has no API key configured".to_string());
        }
        if self.llm().resolve_api_key().is_none() {
            warnings.push("LLM provider has no API key configured".to_string());
        }
        if self.tts().resolve_api_key().is_none() {
            warnings.push("TTS vendor has no API key configured".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        let stt = self.stt();
        if stt.sample_rate == 0 {
            errors.push("stt.sample_rate must be positive".to_string());
        }
        if stt.backoff_base_ms > stt.backoff_max_ms {
            warnings.push(format!(
                "stt.backoff_base_ms ({}) exceeds stt.backoff_max_ms ({})",
                stt.backoff_base_ms, stt.backoff_max_ms
            ));
        }

        let session = self.session();
        if session.chunk_max_chars == 0 {
            errors.push("session.chunk_max_chars must be positive".to_string());
        }
        if session.early_audio.policy == EarlyAudioPolicy::Buffer
            && session.early_audio.capacity == 0
        {
            errors.push("session.early_audio.capacity must be positive for the buffer policy".to_string());
        }
        if let Some(dir) = session.capture_path() {
            if !dir.exists() {
                warnings.push(format!(
                    "Capture directory does not exist and will be created: {}",
                    dir.display()
                ));
            }
        }

        if let Some(knowledge) = self.assistant.as_ref().and_then(|a| a.knowledge.as_ref()) {
            if knowledge.source_count() > 1 {
                errors.push(
                    "assistant.knowledge must set only one of inline, file, url".to_string(),
                );
            }
            if let Some(file) = &knowledge.file {
                let expanded = shellexpand::tilde(file);
                if !Path::new(expanded.as_ref()).exists() {
                    errors.push(format!("Knowledge file not found: {file}"));
                }
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Parley data: `~/.parley/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".parley")
}
