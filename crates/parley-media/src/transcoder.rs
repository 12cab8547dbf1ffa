//! Streaming audio transcoder backed by an external decoder process.
//!
//! Container audio is written to the decoder's stdin as it arrives and raw
//! mono s16le PCM is read back from its stdout as soon as it is produced.

use std::process::Stdio;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_core::config::TranscoderConfig;
use parley_core::types::AudioEncoding;

const READ_CHUNK: usize = 4096;

/// What the decoder should expect on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputFormat {
    Container(String),
    RawPcm { sample_rate: u32 },
}

impl InputFormat {
    pub fn for_encoding(encoding: &AudioEncoding, sample_rate: Option<u32>, fallback_rate: u32) -> Self {
        match encoding {
            AudioEncoding::Container(format) => InputFormat::Container(format.clone()),
            AudioEncoding::Pcm16 => InputFormat::RawPcm {
                sample_rate: sample_rate.unwrap_or(fallback_rate),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscoderEvent {
    /// Decoded PCM, in stdout order.
    Pcm(Bytes),
    /// The decoder complained about the input. Decoding continues.
    DecodeError(String),
    /// The process exited. Sent after the last `Pcm` event.
    Exited { code: Option<i32> },
}

/// Handle to a running transcoder.
///
/// Dropping the handle kills the process; call [`TranscoderLink::finish`] to
/// let it drain instead.
#[derive(Debug)]
pub struct TranscoderLink {
    input: Option<mpsc::UnboundedSender<Bytes>>,
    cancel: CancellationToken,
}

impl TranscoderLink {
    pub fn new(input: mpsc::UnboundedSender<Bytes>, cancel: CancellationToken) -> Self {
        Self {
            input: Some(input),
            cancel,
        }
    }

    /// Queue bytes for the decoder. Returns false once the input side is closed.
    pub fn feed(&self, data: Bytes) -> bool {
        match &self.input {
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Close stdin so the decoder flushes and exits.
    pub fn finish(&mut self) {
        self.input = None;
    }

    pub fn kill(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TranscoderLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Decoder arguments: `<input> -i pipe:0 -acodec pcm_s16le -ac 1 -ar <rate> -f s16le pipe:1`.
pub fn ffmpeg_args(format: &InputFormat, output_rate: u32) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    match format {
        InputFormat::Container(fmt) => {
            args.extend(["-f".into(), fmt.clone()]);
        }
        InputFormat::RawPcm { sample_rate } => {
            args.extend([
                "-f".into(),
                "s16le".into(),
                "-ar".into(),
                sample_rate.to_string(),
                "-ac".into(),
                "1".into(),
            ]);
        }
    }
    args.extend([
        "-i".into(),
        "pipe:0".into(),
        "-acodec".into(),
        "pcm_s16le".into(),
        "-ac".into(),
        "1".into(),
        "-ar".into(),
        output_rate.to_string(),
        "-f".into(),
        "s16le".into(),
        "pipe:1".into(),
    ]);
    args
}

/// Start the configured decoder for `format`, producing PCM at `output_rate`.
pub fn spawn_ffmpeg(
    config: &TranscoderConfig,
    format: &InputFormat,
    output_rate: u32,
    events: mpsc::UnboundedSender<TranscoderEvent>,
) -> Result<TranscoderLink> {
    let args = ffmpeg_args(format, output_rate);
    debug!(program = %config.program, ?format, output_rate, "Starting transcoder");
    spawn_process(&config.program, &args, events)
}

/// Run `program` as a streaming stdin→stdout filter.
pub fn spawn_process(
    program: &str,
    args: &[String],
    events: mpsc::UnboundedSender<TranscoderEvent>,
) -> Result<TranscoderLink> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start transcoder `{program}`"))?;

    let mut stdin = child.stdin.take().context("transcoder stdin unavailable")?;
    let mut stdout = child.stdout.take().context("transcoder stdout unavailable")?;
    let stderr = child.stderr.take().context("transcoder stderr unavailable")?;

    let cancel = CancellationToken::new();
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();

    // stdin writer: closing the channel closes stdin
    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                next = input_rx.recv() => match next {
                    Some(data) => {
                        if let Err(e) = stdin.write_all(&data).await {
                            debug!(error = %e, "Transcoder stdin closed");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });

    // stdout reader
    let reader_cancel = cancel.clone();
    let reader_events = events.clone();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                _ = reader_cancel.cancelled() => break,
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if reader_events
                            .send(TranscoderEvent::Pcm(Bytes::copy_from_slice(&buf[..n])))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Transcoder stdout read failed");
                        break;
                    }
                },
            }
        }
    });

    // stderr: surfaced as non-fatal decode errors
    let stderr_cancel = cancel.clone();
    let stderr_events = events.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = stderr_cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        let _ = stderr_events.send(TranscoderEvent::DecodeError(line));
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                },
            }
        }
    });

    let wait_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = wait_cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Transcoder kill failed");
                }
            }
            status = async {
                let _ = reader.await;
                child.wait().await
            } => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(error = %e, "Transcoder wait failed");
                        None
                    }
                };
                let _ = events.send(TranscoderEvent::Exited { code });
            }
        }
    });

    Ok(TranscoderLink::new(input_tx, cancel))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn collect_until_exit(rx: &mut mpsc::UnboundedReceiver<TranscoderEvent>) -> (Vec<u8>, Option<i32>) {
        let mut pcm = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("transcoder event timed out")
                .expect("transcoder channel closed");
            match event {
                TranscoderEvent::Pcm(bytes) => pcm.extend_from_slice(&bytes),
                TranscoderEvent::DecodeError(_) => {}
                TranscoderEvent::Exited { code } => return (pcm, code),
            }
        }
    }

    fn program_available(program: &str) -> bool {
        std::process::Command::new(program)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    #[test]
    fn test_ffmpeg_args_for_container() {
        let args = ffmpeg_args(&InputFormat::Container("webm".into()), 16_000);
        let joined = args.join(" ");
        assert!(joined.contains("-f webm -i pipe:0"));
        assert!(joined.ends_with("-acodec pcm_s16le -ac 1 -ar 16000 -f s16le pipe:1"));
    }

    #[test]
    fn test_ffmpeg_args_for_raw_pcm() {
        let args = ffmpeg_args(&InputFormat::RawPcm { sample_rate: 48_000 }, 16_000);
        let joined = args.join(" ");
        assert!(joined.contains("-f s16le -ar 48000 -ac 1 -i pipe:0"));
        assert!(joined.contains("-ar 16000 -f s16le pipe:1"));
    }

    #[test]
    fn test_input_format_for_encoding() {
        assert_eq!(
            InputFormat::for_encoding(&AudioEncoding::Container("ogg".into()), None, 16_000),
            InputFormat::Container("ogg".into())
        );
        assert_eq!(
            InputFormat::for_encoding(&AudioEncoding::Pcm16, Some(44_100), 16_000),
            InputFormat::RawPcm { sample_rate: 44_100 }
        );
    }

    #[tokio::test]
    async fn test_pipe_preserves_order_and_drains_on_finish() {
        if !program_available("cat") {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = spawn_process("cat", &[], tx).unwrap();
        let mut expected = Vec::new();
        for i in 0..50u8 {
            let frame = vec![i; 100];
            expected.extend_from_slice(&frame);
            assert!(link.feed(Bytes::from(frame)));
        }
        link.finish();
        assert!(!link.feed(Bytes::from_static(b"late")));

        let (pcm, code) = collect_until_exit(&mut rx).await;
        assert_eq!(pcm, expected);
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn test_kill_suppresses_exit_event() {
        if !program_available("cat") {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = spawn_process("cat", &[], tx).unwrap();
        link.kill();
        link.kill();
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            let mut saw_exit = false;
            while let Some(event) = rx.recv().await {
                if matches!(event, TranscoderEvent::Exited { .. }) {
                    saw_exit = true;
                }
            }
            saw_exit
        })
        .await
        .expect("channel should close after kill");
        assert!(!drained);
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = spawn_process("/nonexistent/parley-decoder", &[], tx).unwrap_err();
        assert!(err.to_string().contains("failed to start transcoder"));
    }

    #[tokio::test]
    async fn test_ffmpeg_silence_in_silence_out() {
        if !program_available("ffmpeg") {
            return;
        }
        // one second of 16 kHz silence wrapped as WAV
        let wav = crate::stt::pcm_to_wav(&vec![0u8; 32_000], 16_000, 1, 16);
        let config = TranscoderConfig {
            program: "ffmpeg".into(),
            input_format: "wav".into(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = spawn_ffmpeg(&config, &InputFormat::Container("wav".into()), 16_000, tx).unwrap();
        for piece in wav.chunks(1024) {
            link.feed(Bytes::copy_from_slice(piece));
        }
        link.finish();
        let (pcm, code) = collect_until_exit(&mut rx).await;
        assert_eq!(code, Some(0));
        assert!((31_000..=33_000).contains(&pcm.len()), "got {} bytes", pcm.len());
        assert!(pcm.iter().all(|b| *b == 0));
    }
}
