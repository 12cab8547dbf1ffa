//! Per-client voice session.
//!
//! A [`Session`] owns everything one client connection needs: the STT link,
//! the TTS link, the decoder, the LLM task for the open turn, the history and
//! the usage counters. Every external stream feeds a channel that only
//! [`Session::run`] consumes, so all of that state is mutated in one place,
//! one event at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_core::config::{
    EarlyAudioPolicy, LlmConfig, SessionConfig, SttConfig, TranscoderConfig, TtsConfig,
    TurnOverlapPolicy,
};
use parley_core::conversation::Conversation;
use parley_core::error::{ParleyError, Vendor};
use parley_core::profile::SessionProfile;
use parley_core::protocol::{ClientControl, ClientMessage, ServerEvent};
use parley_core::types::AudioFrame;
use parley_core::usage::{UsageAccumulator, UsageRates, UsageSnapshot};
use parley_media::capture::AudioCapture;
use parley_media::stt::{SttEvent, SttLink};
use parley_media::transcoder::{InputFormat, TranscoderEvent, TranscoderLink};
use parley_media::tts_stream::{TtsEvent, TtsLink, TtsRequest};

use crate::connector::Connector;
use crate::turn::{LlmEvent, Turn, spawn_reply};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    ListeningForAudio,
    AwaitingTranscript,
    GeneratingReply,
    SynthesizingSpeech,
    Closed,
}

/// A frame for the client transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
}

/// Everything that reaches a session through its inbox.
#[derive(Debug)]
pub enum SessionInput {
    /// Binary client frame: container audio.
    Binary(Bytes),
    /// Text client frame: control message or JSON audio.
    Text(String),
    Disconnected,
    TransportError(String),
    SttConnected {
        generation: u64,
        result: anyhow::Result<(SttLink, mpsc::UnboundedReceiver<SttEvent>)>,
    },
    TtsConnected {
        generation: u64,
        result: anyhow::Result<(TtsLink, mpsc::UnboundedReceiver<TtsEvent>)>,
    },
}

/// Observable summary, republished after every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub turn_id: Option<String>,
    pub pending_turns: usize,
    pub history_len: usize,
    pub stt_connected: bool,
    pub stt_attempts: u32,
    pub early_frames: usize,
    pub usage: UsageSnapshot,
}

/// Cheap, cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    inbox: mpsc::UnboundedSender<SessionInput>,
    status: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn send_binary(&self, data: Bytes) -> bool {
        self.inbox.send(SessionInput::Binary(data)).is_ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbox.send(SessionInput::Text(text.into())).is_ok()
    }

    /// The client went away. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.inbox.send(SessionInput::Disconnected);
    }

    pub fn transport_error(&self, reason: impl Into<String>) {
        let _ = self.inbox.send(SessionInput::TransportError(reason.into()));
    }

    /// Close without going through the inbox (server shutdown).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.status.borrow().state == SessionState::Closed
    }

    /// Wait until the published status satisfies `pred`.
    pub async fn wait_for(&self, pred: impl FnMut(&SessionStatus) -> bool) -> SessionStatus {
        let mut rx = self.status.clone();
        let reached = rx.wait_for(pred).await.map(|status| status.clone());
        match reached {
            Ok(status) => status,
            Err(_) => rx.borrow().clone(),
        }
    }
}

struct ActiveTranscoder {
    generation: u64,
    format: InputFormat,
    link: TranscoderLink,
    /// Output held until every older decoder has drained.
    held: VecDeque<Bytes>,
    /// Client input that arrived after this decoder was retired.
    after: VecDeque<Queued>,
    exited: bool,
}

impl ActiveTranscoder {
    fn new(generation: u64, format: InputFormat, link: TranscoderLink) -> Self {
        Self {
            generation,
            format,
            link,
            held: VecDeque::new(),
            after: VecDeque::new(),
            exited: false,
        }
    }
}

/// Work that must wait for older decoders to flush.
#[derive(Debug)]
enum Queued {
    Pcm(Bytes),
    FinishStt,
}

pub struct Session {
    id: String,
    stt_cfg: SttConfig,
    tts_cfg: TtsConfig,
    llm_cfg: LlmConfig,
    transcoder_cfg: TranscoderConfig,
    session_cfg: SessionConfig,
    rates: UsageRates,
    connector: Arc<dyn Connector>,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbox_tx: mpsc::UnboundedSender<SessionInput>,
    status_tx: watch::Sender<SessionStatus>,
    cancel: CancellationToken,

    state: SessionState,
    conversation: Conversation,
    usage: UsageAccumulator,
    turn: Option<Turn>,
    pending: VecDeque<String>,
    llm_tx: mpsc::UnboundedSender<(String, LlmEvent)>,
    llm_events: mpsc::UnboundedReceiver<(String, LlmEvent)>,

    stt: Option<SttLink>,
    stt_events: Option<mpsc::UnboundedReceiver<SttEvent>>,
    stt_generation: u64,
    stt_connecting: bool,
    stt_attempts: u32,
    stt_finish_pending: bool,
    early: VecDeque<Bytes>,
    early_overflow_warned: bool,

    tts: Option<TtsLink>,
    tts_events: Option<mpsc::UnboundedReceiver<TtsEvent>>,
    tts_generation: u64,
    tts_connecting: bool,
    tts_backlog: Vec<TtsRequest>,

    transcoder: Option<ActiveTranscoder>,
    /// Retired decoders, oldest first.
    draining: VecDeque<ActiveTranscoder>,
    transcoder_generation: u64,
    transcoder_tx: mpsc::UnboundedSender<(u64, TranscoderEvent)>,
    transcoder_events: mpsc::UnboundedReceiver<(u64, TranscoderEvent)>,
    speech_deadline: Option<Instant>,

    capture: Option<AudioCapture>,
    ticks: u64,
}

impl Session {
    /// Create a session and start it on its own task.
    pub fn spawn(
        id: String,
        profile: Arc<SessionProfile>,
        connector: Arc<dyn Connector>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let cancel = CancellationToken::new();

        let handle = SessionHandle {
            id: id.clone(),
            inbox: inbox_tx.clone(),
            status: status_rx,
            cancel: cancel.clone(),
        };
        let session = Session::new(id, &profile, connector, outbound, inbox_tx, status_tx, cancel);
        let task = tokio::spawn(session.run(inbox_rx));
        (handle, task)
    }

    fn new(
        id: String,
        profile: &SessionProfile,
        connector: Arc<dyn Connector>,
        outbound: mpsc::UnboundedSender<Outbound>,
        inbox_tx: mpsc::UnboundedSender<SessionInput>,
        status_tx: watch::Sender<SessionStatus>,
        cancel: CancellationToken,
    ) -> Self {
        let config = &profile.config;
        let (llm_tx, llm_events) = mpsc::unbounded_channel();
        let (transcoder_tx, transcoder_events) = mpsc::unbounded_channel();
        Self {
            id,
            stt_cfg: config.stt(),
            tts_cfg: config.tts(),
            llm_cfg: config.llm(),
            transcoder_cfg: config.transcoder(),
            session_cfg: config.session(),
            rates: config.usage_rates(),
            connector,
            outbound,
            inbox_tx,
            status_tx,
            cancel,
            state: SessionState::Idle,
            conversation: Conversation::new(profile.system_prompt.as_ref()),
            usage: UsageAccumulator::new(),
            turn: None,
            pending: VecDeque::new(),
            llm_tx,
            llm_events,
            stt: None,
            stt_events: None,
            stt_generation: 0,
            stt_connecting: false,
            stt_attempts: 0,
            stt_finish_pending: false,
            early: VecDeque::new(),
            early_overflow_warned: false,
            tts: None,
            tts_events: None,
            tts_generation: 0,
            tts_connecting: false,
            tts_backlog: Vec::new(),
            transcoder: None,
            draining: VecDeque::new(),
            transcoder_generation: 0,
            transcoder_tx,
            transcoder_events,
            speech_deadline: None,
            capture: None,
            ticks: 0,
        }
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionInput>) {
        info!(session_id = %self.id, "Session started");
        #[cfg(feature = "metrics")]
        crate::metrics::record_session_open();

        self.open_capture().await;
        self.set_state(SessionState::ListeningForAudio);
        if self.session_cfg.status_events {
            self.emit(ServerEvent::Status {
                message: "connected".into(),
            });
        }
        self.start_stt_connect(Duration::ZERO);
        self.start_tts_connect();

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        while self.state != SessionState::Closed {
            tokio::select! {
                _ = self.cancel.cancelled() => self.close("shutdown"),
                input = inbox.recv() => match input {
                    Some(input) => self.on_input(input),
                    None => self.close("inbox closed"),
                },
                event = recv_opt(&mut self.stt_events) => match event {
                    Some(event) => self.on_stt_event(event),
                    None => self.stt_events = None,
                },
                event = recv_opt(&mut self.tts_events) => match event {
                    Some(event) => self.on_tts_event(event),
                    None => self.tts_events = None,
                },
                Some((turn_id, event)) = self.llm_events.recv() => self.on_llm_event(&turn_id, event),
                Some((generation, event)) = self.transcoder_events.recv() => {
                    self.on_transcoder_event(generation, event)
                }
                _ = tick.tick() => self.on_tick(),
            }
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_session_close();
        info!(session_id = %self.id, "Session ended");
    }

    // --- client input ---

    fn on_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Binary(data) => {
                let frame = AudioFrame::container(data, self.transcoder_cfg.input_format.clone());
                self.on_audio(frame, true);
            }
            SessionInput::Text(text) => match ClientMessage::parse_text(&text) {
                Ok(ClientMessage::Control(control)) => self.on_control(control),
                Ok(ClientMessage::Audio(frame)) => self.on_audio(frame, false),
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "Ignoring client message");
                    self.emit(ServerEvent::Warning {
                        text: e.to_string(),
                    });
                }
            },
            SessionInput::Disconnected => self.close("client disconnected"),
            SessionInput::TransportError(reason) => self.on_error(ParleyError::Transport(reason)),
            SessionInput::SttConnected { generation, result } => {
                self.on_stt_connected(generation, result)
            }
            SessionInput::TtsConnected { generation, result } => {
                self.on_tts_connected(generation, result)
            }
        }
    }

    fn on_audio(&mut self, frame: AudioFrame, binary: bool) {
        if frame.is_empty() {
            return;
        }
        if binary && self.session_cfg.echo_audio {
            self.send(Outbound::Binary(frame.data.clone()));
        }
        if let Some(capture) = &self.capture {
            capture.write(&frame.data);
        }
        if frame.is_ready_pcm(self.stt_cfg.sample_rate) {
            self.after_decoders(Queued::Pcm(frame.data));
        } else {
            self.feed_transcoder(frame);
        }
    }

    fn on_control(&mut self, control: ClientControl) {
        match control {
            ClientControl::StopRecording => {
                debug!(session_id = %self.id, "Stop recording");
                self.after_decoders(Queued::FinishStt);
            }
            ClientControl::GetUsage => {
                let usage = self.usage.snapshot();
                self.emit(ServerEvent::Usage {
                    usage,
                    cost: usage.cost(&self.rates),
                });
            }
            ClientControl::ResetUsage => {
                self.usage.reset();
                self.publish();
            }
        }
    }

    // --- transcoder ---

    fn feed_transcoder(&mut self, frame: AudioFrame) {
        let format =
            InputFormat::for_encoding(&frame.encoding, frame.sample_rate, self.stt_cfg.sample_rate);
        let reusable = self.transcoder.as_ref().is_some_and(|t| t.format == format);
        if !reusable && !self.spawn_transcoder(format) {
            return;
        }
        if let Some(active) = &self.transcoder {
            active.link.feed(frame.data);
        }
    }

    /// Close the current decoder's input and let it flush its tail.
    fn retire_transcoder(&mut self) {
        if let Some(mut active) = self.transcoder.take() {
            active.link.finish();
            self.draining.push_back(active);
        }
    }

    /// Run `item` once every decoder fed before it has drained.
    fn after_decoders(&mut self, item: Queued) {
        self.retire_transcoder();
        match self.draining.back_mut() {
            Some(last) => last.after.push_back(item),
            None => self.release(item),
        }
    }

    fn release(&mut self, item: Queued) {
        match item {
            Queued::Pcm(pcm) => self.forward_pcm(pcm),
            Queued::FinishStt => self.finish_stt(),
        }
    }

    fn spawn_transcoder(&mut self, format: InputFormat) -> bool {
        self.retire_transcoder();

        self.transcoder_generation += 1;
        let generation = self.transcoder_generation;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = match self.connector.spawn_transcoder(
            &self.transcoder_cfg,
            &format,
            self.stt_cfg.sample_rate,
            tx,
        ) {
            Ok(link) => link,
            Err(e) => {
                self.on_error(ParleyError::TranscoderDied(format!("{e:#}")));
                return false;
            }
        };

        let forward = self.transcoder_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if forward.send((generation, event)).is_err() {
                    break;
                }
            }
        });

        debug!(session_id = %self.id, generation, ?format, "Transcoder started");
        self.transcoder = Some(ActiveTranscoder::new(generation, format, link));
        true
    }

    /// The decoder whose output may go straight to STT.
    fn head_transcoder(&self) -> Option<u64> {
        self.draining
            .front()
            .or(self.transcoder.as_ref())
            .map(|t| t.generation)
    }

    fn transcoder_mut(&mut self, generation: u64) -> Option<&mut ActiveTranscoder> {
        self.draining
            .iter_mut()
            .chain(self.transcoder.as_mut())
            .find(|t| t.generation == generation)
    }

    fn on_transcoder_event(&mut self, generation: u64, event: TranscoderEvent) {
        let head = self.head_transcoder() == Some(generation);
        let current = self
            .transcoder
            .as_ref()
            .is_some_and(|t| t.generation == generation);
        let Some(active) = self.transcoder_mut(generation) else {
            return;
        };

        match event {
            TranscoderEvent::Pcm(pcm) if head => self.forward_pcm(pcm),
            TranscoderEvent::Pcm(pcm) => active.held.push_back(pcm),
            TranscoderEvent::DecodeError(message) => {
                warn!(session_id = %self.id, generation, %message, "Transcoder reported a decode error");
            }
            TranscoderEvent::Exited { code } => {
                if current {
                    // the live decoder only exits early when ffmpeg dies
                    self.transcoder = None;
                    self.on_error(ParleyError::TranscoderDied(format!(
                        "decoder exited unexpectedly (code {code:?})"
                    )));
                    return;
                }
                active.exited = true;
                self.advance_drain();
            }
        }
    }

    /// Pop drained decoders off the front, releasing what queued behind them.
    fn advance_drain(&mut self) {
        while self.draining.front().is_some_and(|t| t.exited) {
            let Some(done) = self.draining.pop_front() else {
                break;
            };
            debug!(session_id = %self.id, generation = done.generation, "Transcoder drained");
            for item in done.after {
                self.release(item);
            }
            let held = match self.draining.front_mut().or(self.transcoder.as_mut()) {
                Some(next) => std::mem::take(&mut next.held),
                None => VecDeque::new(),
            };
            for pcm in held {
                self.forward_pcm(pcm);
            }
        }
    }

    // --- STT ---

    /// Send decoded audio to STT. A link that is finishing or gone refuses
    /// it; the audio then waits for the next stream like early audio.
    fn forward_pcm(&mut self, pcm: Bytes) {
        if let Some(link) = &self.stt {
            if link.send_audio(pcm.clone()) {
                return;
            }
        }
        self.ensure_stt();
        self.buffer_early(pcm);
    }

    fn buffer_early(&mut self, pcm: Bytes) {
        match self.session_cfg.early_audio.policy {
            EarlyAudioPolicy::Drop => {
                self.warn_early_once("Speech recognition is not ready yet; audio dropped");
            }
            EarlyAudioPolicy::Buffer => {
                if self.early.len() >= self.session_cfg.early_audio.capacity.max(1) {
                    self.early.pop_front();
                    self.warn_early_once("Speech recognition is not ready yet; oldest audio dropped");
                }
                self.early.push_back(pcm);
                self.publish();
            }
        }
    }

    fn warn_early_once(&mut self, text: &str) {
        if self.early_overflow_warned {
            return;
        }
        self.early_overflow_warned = true;
        warn!(session_id = %self.id, "{text}");
        self.emit(ServerEvent::Warning { text: text.into() });
    }

    fn ensure_stt(&mut self) {
        if self.stt.is_none() && !self.stt_connecting && self.state != SessionState::Closed {
            self.start_stt_connect(Duration::ZERO);
        }
    }

    fn start_stt_connect(&mut self, delay: Duration) {
        self.stt_generation += 1;
        self.stt_connecting = true;
        let generation = self.stt_generation;
        let connector = self.connector.clone();
        let config = self.stt_cfg.clone();
        let inbox = self.inbox_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = async {
                    tokio::time::sleep(delay).await;
                    let (tx, rx) = mpsc::unbounded_channel();
                    match tokio::time::timeout(config.connect_timeout(), connector.connect_stt(&config, tx)).await {
                        Ok(result) => result.map(|link| (link, rx)),
                        Err(_) => Err(anyhow::anyhow!(
                            "STT connect timed out after {}ms",
                            config.connect_timeout_ms
                        )),
                    }
                } => {
                    let _ = inbox.send(SessionInput::SttConnected { generation, result });
                }
            }
        });
    }

    fn on_stt_connected(
        &mut self,
        generation: u64,
        result: anyhow::Result<(SttLink, mpsc::UnboundedReceiver<SttEvent>)>,
    ) {
        if generation != self.stt_generation || self.state == SessionState::Closed {
            debug!(session_id = %self.id, generation, "Discarding stale STT connect result");
            return;
        }
        self.stt_connecting = false;
        match result {
            Ok((link, events)) => {
                info!(session_id = %self.id, vendor = %Vendor::Stt, buffered = self.early.len(), "STT ready");
                for pcm in self.early.drain(..) {
                    link.send_audio(pcm);
                }
                if std::mem::take(&mut self.stt_finish_pending) {
                    link.finish();
                }
                self.stt = Some(link);
                self.stt_events = Some(events);
                self.stt_attempts = 0;
                self.early_overflow_warned = false;
                self.publish();
            }
            Err(e) => self.on_stt_failure(format!("{e:#}")),
        }
    }

    fn on_stt_failure(&mut self, reason: String) {
        self.stt = None;
        self.stt_events = None;
        self.stt_attempts += 1;
        let max = self.stt_cfg.max_retries;
        if self.stt_attempts > max {
            self.on_error(ParleyError::VendorConnect {
                vendor: Vendor::Stt,
                message: format!("giving up after {} attempts: {reason}", self.stt_attempts),
            });
            return;
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_stt_reconnect();

        let delay = self.stt_cfg.backoff_delay(self.stt_attempts);
        warn!(
            session_id = %self.id,
            vendor = %Vendor::Stt,
            attempt = self.stt_attempts,
            max,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "STT unavailable, reconnecting"
        );
        self.emit(ServerEvent::Warning {
            text: format!(
                "Speech recognition connection lost; reconnecting ({}/{max})",
                self.stt_attempts
            ),
        });
        self.start_stt_connect(delay);
        self.publish();
    }

    fn finish_stt(&mut self) {
        match &self.stt {
            Some(link) => link.finish(),
            None => self.stt_finish_pending = true,
        }
    }

    fn on_stt_event(&mut self, event: SttEvent) {
        match event {
            SttEvent::Transcript {
                text,
                is_final,
                raw,
            } => {
                self.emit(ServerEvent::Transcription { transcription: raw });
                if !is_final {
                    if self.state == SessionState::ListeningForAudio {
                        self.set_state(SessionState::AwaitingTranscript);
                    }
                    return;
                }
                let text = text.trim();
                if text.is_empty() {
                    if self.state == SessionState::AwaitingTranscript {
                        self.set_state(SessionState::ListeningForAudio);
                    }
                    return;
                }
                self.on_final(text.to_string());
            }
            SttEvent::Error(message) => {
                warn!(session_id = %self.id, vendor = %Vendor::Stt, %message, "STT error");
                self.emit(ServerEvent::Warning { text: message });
            }
            SttEvent::Closed { graceful: true, .. } => {
                debug!(session_id = %self.id, buffered = self.early.len(), "STT stream finished");
                self.stt = None;
                self.stt_events = None;
                if !self.early.is_empty() || self.stt_finish_pending {
                    self.ensure_stt();
                }
                self.publish();
            }
            SttEvent::Closed { reason, .. } => self.on_stt_failure(reason),
        }
    }

    // --- turns ---

    fn on_final(&mut self, text: String) {
        if self.turn.is_none() {
            self.start_turn(text);
            return;
        }
        match self.session_cfg.turn_overlap {
            TurnOverlapPolicy::Queue if self.pending.len() < self.session_cfg.max_pending_turns => {
                debug!(session_id = %self.id, pending = self.pending.len() + 1, "Queued transcript");
                self.pending.push_back(text);
                self.publish();
            }
            TurnOverlapPolicy::Queue | TurnOverlapPolicy::Reject => {
                info!(session_id = %self.id, "Rejecting transcript while a reply is in progress");
                #[cfg(feature = "metrics")]
                crate::metrics::record_turn("rejected");
                self.emit(ServerEvent::AiError {
                    text: "Still answering the previous question; please try again in a moment."
                        .into(),
                });
            }
            TurnOverlapPolicy::BargeIn => {
                self.cancel_turn("interrupted");
                self.start_turn(text);
            }
        }
    }

    fn start_turn(&mut self, text: String) {
        if let Err(e) = self.conversation.push_user(&text) {
            warn!(session_id = %self.id, error = %e, "Transcript not added to history");
            return;
        }
        let (input_tokens, input_words) = self.usage.on_input_text(&self.conversation.prompt_text());
        self.emit(ServerEvent::TokenUsage {
            input_tokens,
            input_words,
        });

        let turn_id = Uuid::new_v4().to_string();
        info!(session_id = %self.id, turn_id = %turn_id, transcript = %text, "Turn started");
        let task = spawn_reply(
            self.connector.clone(),
            self.llm_cfg.clone(),
            self.conversation.messages().to_vec(),
            turn_id.clone(),
            self.llm_tx.clone(),
        );
        let mut turn = Turn::new(turn_id, text, self.session_cfg.chunk_max_chars);
        turn.attach(task);
        self.turn = Some(turn);
        self.ensure_tts();
        self.set_state(SessionState::GeneratingReply);
    }

    fn open_turn_mut(&mut self, turn_id: &str) -> Option<&mut Turn> {
        self.turn.as_mut().filter(|t| t.id == turn_id)
    }

    fn on_llm_event(&mut self, turn_id: &str, event: LlmEvent) {
        let Some(turn) = self.open_turn_mut(turn_id) else {
            debug!(session_id = %self.id, turn_id, "Dropping LLM event for a closed turn");
            return;
        };
        if turn.llm_done() {
            return;
        }

        match event {
            LlmEvent::Delta(text) => {
                let requests = turn.push_delta(&text);
                self.usage.on_output_token_delta(&text);
                self.emit(ServerEvent::AiStream { text });
                for request in requests {
                    self.speak(request);
                }
            }
            LlmEvent::Usage(usage) => {
                self.usage.on_final_counts(
                    usage.input_tokens.unwrap_or(0),
                    usage.output_tokens.unwrap_or(0),
                );
            }
            LlmEvent::Done => {
                let last = turn.finish();
                let reply = turn.take_reply_for_history();
                let sent = turn.sent();
                if let Some(request) = last {
                    self.speak(request);
                }
                self.emit(ServerEvent::AiDone);
                let (output_tokens, output_words) = self.usage.turn_output();
                self.emit(ServerEvent::TokenUsageFinal {
                    output_tokens,
                    output_words,
                    total_tokens: self.usage.turn_input_tokens() + output_tokens,
                });
                if let Some(reply) = reply {
                    let _ = self.conversation.push_assistant(&reply);
                }
                if sent == 0 {
                    self.complete_turn();
                } else {
                    self.touch_speech_deadline();
                    self.set_state(SessionState::SynthesizingSpeech);
                }
            }
            LlmEvent::Failed(err) => self.on_error(err),
        }
    }

    /// The reply has been fully spoken (or never needed speech).
    fn complete_turn(&mut self) {
        self.speech_deadline = None;
        if let Some(turn) = self.turn.take() {
            info!(session_id = %self.id, turn_id = %turn.id, "Turn complete");
            #[cfg(feature = "metrics")]
            crate::metrics::record_turn("completed");
        }
        self.next_turn();
    }

    /// Report a turn-level failure once and move on.
    fn fail_turn(&mut self, err: ParleyError) {
        warn!(session_id = %self.id, kind = err.kind(), error = %err, "Turn failed");
        #[cfg(feature = "metrics")]
        crate::metrics::record_error(err.kind());
        self.emit(ServerEvent::AiError {
            text: err.to_string(),
        });
        self.cancel_turn("failed");
        self.next_turn();
    }

    /// Drop the open turn: stop the LLM, silence its TTS context, keep any
    /// partial reply in history.
    fn cancel_turn(&mut self, outcome: &'static str) {
        self.speech_deadline = None;
        let Some(mut turn) = self.turn.take() else {
            return;
        };
        turn.abort();
        self.tts_backlog.retain(|r| r.context_id != turn.id);
        if turn.sent() > 0 {
            if let Some(tts) = &self.tts {
                tts.cancel_context(&turn.id);
            }
        }
        if let Some(reply) = turn.take_reply_for_history() {
            let _ = self.conversation.push_assistant(&reply);
        }
        info!(session_id = %self.id, turn_id = %turn.id, outcome, "Turn cancelled");
        #[cfg(feature = "metrics")]
        crate::metrics::record_turn(outcome);
    }

    fn next_turn(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.set_state(SessionState::ListeningForAudio);
        if let Some(next) = self.pending.pop_front() {
            self.start_turn(next);
        }
    }

    // --- TTS ---

    fn ensure_tts(&mut self) {
        if self.tts.is_none() && !self.tts_connecting {
            self.start_tts_connect();
        }
    }

    fn start_tts_connect(&mut self) {
        self.tts_generation += 1;
        self.tts_connecting = true;
        let generation = self.tts_generation;
        let connector = self.connector.clone();
        let config = self.tts_cfg.clone();
        let inbox = self.inbox_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = async {
                    let (tx, rx) = mpsc::unbounded_channel();
                    match tokio::time::timeout(config.connect_timeout(), connector.connect_tts(&config, tx)).await {
                        Ok(result) => result.map(|link| (link, rx)),
                        Err(_) => Err(anyhow::anyhow!(
                            "TTS connect timed out after {}ms",
                            config.connect_timeout_ms
                        )),
                    }
                } => {
                    let _ = inbox.send(SessionInput::TtsConnected { generation, result });
                }
            }
        });
    }

    fn on_tts_connected(
        &mut self,
        generation: u64,
        result: anyhow::Result<(TtsLink, mpsc::UnboundedReceiver<TtsEvent>)>,
    ) {
        if generation != self.tts_generation || self.state == SessionState::Closed {
            return;
        }
        self.tts_connecting = false;
        match result {
            Ok((link, events)) => {
                info!(session_id = %self.id, vendor = %Vendor::Tts, backlog = self.tts_backlog.len(), "TTS ready");
                for request in self.tts_backlog.drain(..) {
                    link.speak(request);
                }
                self.tts = Some(link);
                self.tts_events = Some(events);
            }
            Err(e) => {
                let err = ParleyError::VendorConnect {
                    vendor: Vendor::Tts,
                    message: format!("{e:#}"),
                };
                self.tts_backlog.clear();
                if self.turn.is_some() {
                    self.on_error(err);
                } else {
                    warn!(session_id = %self.id, error = %err, "TTS unavailable");
                    self.emit(ServerEvent::Warning {
                        text: err.to_string(),
                    });
                }
            }
        }
    }

    fn speak(&mut self, request: TtsRequest) {
        if let Some(link) = &self.tts {
            if link.speak(request.clone()) {
                return;
            }
            self.tts = None;
            self.tts_events = None;
        }
        self.tts_backlog.push(request);
        self.ensure_tts();
    }

    fn on_tts_event(&mut self, event: TtsEvent) {
        match event {
            TtsEvent::Chunk { context_id, audio } => {
                if self.open_turn_mut(&context_id).is_some() {
                    self.emit(ServerEvent::ai_audio(&audio, context_id));
                    if self.speech_deadline.is_some() {
                        self.touch_speech_deadline();
                    }
                } else {
                    debug!(session_id = %self.id, %context_id, "Ignoring audio for a stale context");
                }
            }
            TtsEvent::Done { context_id } => {
                let finished = self
                    .open_turn_mut(&context_id)
                    .is_some_and(|t| t.llm_done());
                if finished {
                    self.complete_turn();
                }
            }
            TtsEvent::Error {
                context_id,
                message,
            } => {
                let ours = match &context_id {
                    Some(id) => self.open_turn_mut(id).is_some(),
                    None => self.turn.is_some(),
                };
                if ours {
                    self.on_error(ParleyError::VendorProtocol {
                        vendor: Vendor::Tts,
                        message,
                    });
                } else {
                    warn!(session_id = %self.id, ?context_id, %message, "TTS error for a stale context");
                }
            }
            TtsEvent::Closed { reason } => {
                warn!(session_id = %self.id, vendor = %Vendor::Tts, %reason, "TTS connection closed");
                self.tts = None;
                self.tts_events = None;
                let speaking = self.turn.as_ref().is_some_and(|t| t.sent() > 0);
                if speaking {
                    self.on_error(ParleyError::VendorConnect {
                        vendor: Vendor::Tts,
                        message: format!("connection closed: {reason}"),
                    });
                }
            }
        }
    }

    /// Give TTS another full timeout to deliver the rest of the reply.
    fn touch_speech_deadline(&mut self) {
        self.speech_deadline = self
            .session_cfg
            .synthesis_timeout()
            .map(|timeout| Instant::now() + timeout);
    }

    // --- housekeeping ---

    fn on_tick(&mut self) {
        self.usage.tick();
        self.ticks += 1;
        if self.speech_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.speech_deadline = None;
            let secs = self.session_cfg.synthesis_timeout_secs;
            self.on_error(ParleyError::VendorProtocol {
                vendor: Vendor::Tts,
                message: format!("speech synthesis stalled for {secs}s"),
            });
        }
        if let Some(every) = self.session_cfg.usage_report_interval_secs.filter(|s| *s > 0) {
            if self.ticks % every == 0 {
                let usage = self.usage.snapshot();
                self.emit(ServerEvent::Usage {
                    usage,
                    cost: usage.cost(&self.rates),
                });
            }
        }
        self.publish();
    }

    async fn open_capture(&mut self) {
        let Some(dir) = self.session_cfg.capture_path() else {
            return;
        };
        match AudioCapture::create(&dir, &self.id, &self.transcoder_cfg.input_format).await {
            Ok(capture) => {
                info!(session_id = %self.id, path = %capture.path().display(), "Capturing inbound audio");
                self.capture = Some(capture);
            }
            Err(e) => warn!(session_id = %self.id, error = %e, "Audio capture disabled"),
        }
    }

    /// Fatal errors end the session; the rest end the open turn.
    fn on_error(&mut self, err: ParleyError) {
        if err.is_fatal() {
            self.fail(err);
        } else {
            self.fail_turn(err);
        }
    }

    /// Report a session-terminating error once, then close.
    fn fail(&mut self, err: ParleyError) {
        if self.state == SessionState::Closed {
            return;
        }
        warn!(session_id = %self.id, kind = err.kind(), error = %err, "Session failed");
        #[cfg(feature = "metrics")]
        crate::metrics::record_error(err.kind());
        self.emit(ServerEvent::AiError {
            text: err.to_string(),
        });
        self.close(err.kind());
    }

    /// Release every resource. Idempotent.
    fn close(&mut self, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        info!(session_id = %self.id, reason, "Closing session");

        if let Some(mut turn) = self.turn.take() {
            turn.abort();
            if let Some(reply) = turn.take_reply_for_history() {
                let _ = self.conversation.push_assistant(&reply);
            }
        }
        self.pending.clear();

        self.stt_generation += 1;
        self.stt_connecting = false;
        if let Some(link) = self.stt.take() {
            link.close();
        }
        self.stt_events = None;
        self.early.clear();

        self.tts_generation += 1;
        self.tts_connecting = false;
        if let Some(link) = self.tts.take() {
            link.close();
        }
        self.tts_events = None;
        self.tts_backlog.clear();

        if let Some(active) = self.transcoder.take() {
            active.link.kill();
        }
        for active in self.draining.drain(..) {
            active.link.kill();
        }
        self.speech_deadline = None;

        if let Some(capture) = self.capture.as_mut() {
            capture.finish();
        }
        self.usage.stop();
        self.set_state(SessionState::Closed);
        self.cancel.cancel();
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(session_id = %self.id, from = ?self.state, to = ?state, "State change");
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        self.status_tx.send_replace(SessionStatus {
            state: self.state,
            turn_id: self.turn.as_ref().map(|t| t.id.clone()),
            pending_turns: self.pending.len(),
            history_len: self.conversation.len(),
            stt_connected: self.stt.as_ref().is_some_and(SttLink::accepts_audio),
            stt_attempts: self.stt_attempts,
            early_frames: self.early.len(),
            usage: self.usage.snapshot(),
        });
    }

    fn emit(&self, event: ServerEvent) {
        match event.to_json() {
            Ok(json) => self.send(Outbound::Text(json)),
            Err(e) => warn!(session_id = %self.id, error = %e, "Failed to serialize event"),
        }
    }

    fn send(&self, frame: Outbound) {
        if self.outbound.send(frame).is_err() {
            debug!(session_id = %self.id, "Client writer gone, dropping frame");
        }
    }
}

/// Receive from an optional channel; pends forever when there is none.
async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
