//! Scripted [`Connector`] for driving sessions in tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use parley_core::config::{LlmConfig, SttConfig, TranscoderConfig, TtsConfig};
use parley_core::conversation::ConversationMessage;
use parley_media::stt::{SttCommand, SttEvent, SttLink};
use parley_media::transcoder::{InputFormat, TranscoderEvent, TranscoderLink};
use parley_media::tts_stream::{TtsCommand, TtsEvent, TtsLink};
use parley_providers::{CompletionChunk, CompletionStream};

use crate::connector::Connector;

const WAIT: Duration = Duration::from_secs(3);

/// The vendor side of one STT connection.
pub struct FakeStt {
    pub events: mpsc::UnboundedSender<SttEvent>,
    pub commands: mpsc::UnboundedReceiver<SttCommand>,
}

impl FakeStt {
    pub fn transcript(&self, text: &str, is_final: bool) {
        let raw = serde_json::json!({ "type": "transcript", "text": text, "is_final": is_final });
        let _ = self.events.send(SttEvent::Transcript {
            text: text.into(),
            is_final,
            raw,
        });
    }

    pub async fn next_command(&mut self) -> SttCommand {
        tokio::time::timeout(WAIT, self.commands.recv())
            .await
            .expect("timed out waiting for an STT command")
            .expect("STT link dropped")
    }
}

/// The vendor side of one TTS connection.
pub struct FakeTts {
    pub events: mpsc::UnboundedSender<TtsEvent>,
    pub commands: mpsc::UnboundedReceiver<TtsCommand>,
}

impl FakeTts {
    pub async fn next_command(&mut self) -> TtsCommand {
        tokio::time::timeout(WAIT, self.commands.recv())
            .await
            .expect("timed out waiting for a TTS command")
            .expect("TTS link dropped")
    }
}

/// One streamed reply. Dropping `chunks` ends the stream.
pub struct FakeReply {
    pub messages: Vec<ConversationMessage>,
    pub chunks: mpsc::UnboundedSender<anyhow::Result<CompletionChunk>>,
}

impl FakeReply {
    pub fn delta(&self, text: &str) {
        let _ = self.chunks.send(Ok(CompletionChunk {
            delta: Some(text.into()),
            ..Default::default()
        }));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.chunks.send(Err(anyhow::anyhow!(message.to_string())));
    }
}

/// One decoder process. Input is echoed back as PCM until stdin closes,
/// then it exits unless the connector holds exits for the test to send.
pub struct FakeTranscoder {
    pub format: InputFormat,
    pub events: mpsc::UnboundedSender<TranscoderEvent>,
}

#[derive(Default)]
pub struct FakeConnector {
    /// Remaining STT connects that fail before one succeeds.
    pub stt_failures: AtomicU32,
    pub stt_connects: AtomicU32,
    pub tts_fail: AtomicBool,
    /// STT links only flush on finish and keep taking audio.
    pub stt_flush_only: AtomicBool,
    /// Decoders do not report their own exit.
    pub hold_transcoder_exit: AtomicBool,
    stt: Mutex<VecDeque<FakeStt>>,
    tts: Mutex<VecDeque<FakeTts>>,
    llm_errors: Mutex<VecDeque<String>>,
    replies: Mutex<VecDeque<FakeReply>>,
    transcoders: Mutex<Vec<FakeTranscoder>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next reply fail before streaming.
    pub fn fail_next_reply(&self, message: &str) {
        self.llm_errors.lock().unwrap().push_back(message.into());
    }

    pub async fn take_stt(&self) -> FakeStt {
        poll(|| self.stt.lock().unwrap().pop_front(), "STT connect").await
    }

    pub async fn take_tts(&self) -> FakeTts {
        poll(|| self.tts.lock().unwrap().pop_front(), "TTS connect").await
    }

    pub async fn take_reply(&self) -> FakeReply {
        poll(|| self.replies.lock().unwrap().pop_front(), "LLM request").await
    }

    pub fn transcoder_count(&self) -> usize {
        self.transcoders.lock().unwrap().len()
    }

    pub fn transcoder_events(&self, index: usize) -> mpsc::UnboundedSender<TranscoderEvent> {
        self.transcoders.lock().unwrap()[index].events.clone()
    }

    pub fn transcoder_format(&self, index: usize) -> InputFormat {
        self.transcoders.lock().unwrap()[index].format.clone()
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.lock().unwrap().len()
    }
}

/// Poll `f` until it yields a value.
pub async fn poll<T>(mut f: impl FnMut() -> Option<T>, what: &str) -> T {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(value) = f() {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect_stt(
        &self,
        _config: &SttConfig,
        events: mpsc::UnboundedSender<SttEvent>,
    ) -> anyhow::Result<SttLink> {
        self.stt_connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .stt_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection refused");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.stt.lock().unwrap().push_back(FakeStt {
            events,
            commands: rx,
        });
        let link = SttLink::new(tx, CancellationToken::new());
        if self.stt_flush_only.load(Ordering::SeqCst) {
            Ok(link.finish_keeps_stream_open())
        } else {
            Ok(link)
        }
    }

    async fn connect_tts(
        &self,
        _config: &TtsConfig,
        events: mpsc::UnboundedSender<TtsEvent>,
    ) -> anyhow::Result<TtsLink> {
        if self.tts_fail.load(Ordering::SeqCst) {
            anyhow::bail!("tts unavailable");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.tts.lock().unwrap().push_back(FakeTts {
            events,
            commands: rx,
        });
        Ok(TtsLink::new(tx, CancellationToken::new()))
    }

    async fn stream_reply(
        &self,
        _config: &LlmConfig,
        messages: Vec<ConversationMessage>,
    ) -> anyhow::Result<CompletionStream> {
        if let Some(message) = self.llm_errors.lock().unwrap().pop_front() {
            anyhow::bail!(message);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.replies.lock().unwrap().push_back(FakeReply {
            messages,
            chunks: tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    fn spawn_transcoder(
        &self,
        _config: &TranscoderConfig,
        format: &InputFormat,
        _output_rate: u32,
        events: mpsc::UnboundedSender<TranscoderEvent>,
    ) -> anyhow::Result<TranscoderLink> {
        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();
        let cancel = CancellationToken::new();

        let task_events = events.clone();
        let task_cancel = cancel.clone();
        let report_exit = !self.hold_transcoder_exit.load(Ordering::SeqCst);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    data = input_rx.recv() => match data {
                        Some(data) => {
                            let _ = task_events.send(TranscoderEvent::Pcm(data));
                        }
                        None => break,
                    },
                }
            }
            if report_exit {
                let _ = task_events.send(TranscoderEvent::Exited { code: Some(0) });
            }
        });

        self.transcoders.lock().unwrap().push(FakeTranscoder {
            format: format.clone(),
            events,
        });
        Ok(TranscoderLink::new(input_tx, cancel))
    }
}
