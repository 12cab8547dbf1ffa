//! One user utterance and the reply being produced for it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::debug;

use parley_core::config::LlmConfig;
use parley_core::conversation::ConversationMessage;
use parley_core::error::{ParleyError, Vendor};
use parley_media::chunker::TextChunker;
use parley_media::tts_stream::TtsRequest;
use parley_providers::ChunkUsage;

use crate::connector::Connector;

/// What the LLM task reports back to its session, tagged with the turn id.
#[derive(Debug)]
pub enum LlmEvent {
    Delta(String),
    Usage(ChunkUsage),
    Done,
    Failed(ParleyError),
}

/// The reply in flight for one final transcript. The turn id doubles as the
/// TTS context id, so audio for any other id is stale.
#[derive(Debug)]
pub struct Turn {
    pub id: String,
    pub transcript: String,
    pub reply: String,
    chunker: TextChunker,
    sent: usize,
    llm_done: bool,
    recorded: bool,
    task: Option<JoinHandle<()>>,
}

impl Turn {
    pub fn new(id: String, transcript: String, max_chars: usize) -> Self {
        Self {
            id,
            transcript,
            reply: String::new(),
            chunker: TextChunker::new(max_chars),
            sent: 0,
            llm_done: false,
            recorded: false,
            task: None,
        }
    }

    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    /// Buffers handed to TTS so far.
    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn llm_done(&self) -> bool {
        self.llm_done
    }

    /// Append a reply fragment and return the TTS buffers it completed.
    pub fn push_delta(&mut self, delta: &str) -> Vec<TtsRequest> {
        self.reply.push_str(delta);
        let chunks = self.chunker.push(delta);
        chunks
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .map(|c| self.request(c, true))
            .collect()
    }

    /// Close the reply. Returns the final `continue = false` buffer: the
    /// chunker remainder, an empty transcript when text was already sent and
    /// nothing remains, or nothing at all when TTS never saw this turn.
    pub fn finish(&mut self) -> Option<TtsRequest> {
        self.llm_done = true;
        match self.chunker.flush() {
            Some(rest) if !rest.trim().is_empty() => Some(self.request(rest, false)),
            _ if self.sent > 0 => Some(TtsRequest {
                transcript: String::new(),
                context_id: self.id.clone(),
                continue_: false,
            }),
            _ => None,
        }
    }

    /// The reply text to keep in history, once. Blank replies are never kept.
    pub fn take_reply_for_history(&mut self) -> Option<String> {
        if self.recorded || self.reply.trim().is_empty() {
            return None;
        }
        self.recorded = true;
        Some(self.reply.clone())
    }

    /// Stop the LLM task. Further events from it are discarded by id anyway.
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn request(&mut self, transcript: String, continue_: bool) -> TtsRequest {
        self.sent += 1;
        TtsRequest {
            transcript,
            context_id: self.id.clone(),
            continue_,
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Stream a reply on its own task and forward every event to the session.
pub fn spawn_reply(
    connector: Arc<dyn Connector>,
    config: LlmConfig,
    messages: Vec<ConversationMessage>,
    turn_id: String,
    events: mpsc::UnboundedSender<(String, LlmEvent)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let send = |event: LlmEvent| {
            let _ = events.send((turn_id.clone(), event));
        };

        let opened =
            tokio::time::timeout(config.connect_timeout(), connector.stream_reply(&config, messages))
                .await;
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                send(LlmEvent::Failed(ParleyError::VendorConnect {
                    vendor: Vendor::Llm,
                    message: format!("{e:#}"),
                }));
                return;
            }
            Err(_) => {
                send(LlmEvent::Failed(ParleyError::VendorConnect {
                    vendor: Vendor::Llm,
                    message: format!("timed out after {}ms", config.connect_timeout_ms),
                }));
                return;
            }
        };

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    if let Some(delta) = chunk.delta.filter(|d| !d.is_empty()) {
                        send(LlmEvent::Delta(delta));
                    }
                    if let Some(usage) = chunk.usage {
                        send(LlmEvent::Usage(usage));
                    }
                }
                Err(e) => {
                    send(LlmEvent::Failed(ParleyError::VendorProtocol {
                        vendor: Vendor::Llm,
                        message: format!("{e:#}"),
                    }));
                    return;
                }
            }
        }
        debug!(turn_id = %turn_id, "LLM stream finished");
        send(LlmEvent::Done);
    })
}
