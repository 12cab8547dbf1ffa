//! Generic SSE (Server-Sent Events) line parser.
//!
//! Converts any byte stream (usually a `reqwest::Response` body) into a
//! `Stream<Item = SseEvent>`. Lines are split on raw bytes so multi-byte
//! characters that straddle network chunks survive intact.

use std::fmt::Display;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    parse_sse_bytes(response.bytes_stream())
}

/// Parse an arbitrary byte stream as SSE.
pub fn parse_sse_bytes<S, E>(byte_stream: S) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let byte_stream = byte_stream.map(|r| r.map_err(|e| e.to_string()));

    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: Vec::new(),
            current_event: None,
            current_data: Vec::new(),
            current_id: None,
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(newline_pos) = state.buffer.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = state.buffer.drain(..=newline_pos).collect();
                    let line = String::from_utf8_lossy(&raw[..newline_pos]);
                    let line = line.trim_end_matches('\r');

                    if line.is_empty() {
                        // Empty line = dispatch event
                        if let Some(event) = state.dispatch() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }

                    if line.starts_with(':') {
                        continue;
                    }

                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("id:") {
                        state.current_id = Some(value.trim_start().to_string());
                    }
                    continue;
                }

                if state.finished {
                    return None;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => {
                        state.finished = true;
                        // A final line without a trailing newline still counts.
                        if !state.buffer.is_empty() {
                            state.buffer.extend_from_slice(b"\n\n");
                            continue;
                        }
                        return state.dispatch().map(|event| (Ok(event), state));
                    }
                }
            }
        },
    )
}

struct SseState {
    byte_stream: Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>,
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
    finished: bool,
}

impl SseState {
    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect_bytes(chunks: Vec<Bytes>) -> Vec<anyhow::Result<SseEvent>> {
        let source = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        parse_sse_bytes(source).collect().await
    }

    async fn collect(chunks: &[&str]) -> Vec<anyhow::Result<SseEvent>> {
        let chunks = chunks.iter().map(|c| Bytes::from(c.to_string())).collect();
        collect_bytes(chunks).await
    }

    fn data(events: Vec<anyhow::Result<SseEvent>>) -> Vec<String> {
        events.into_iter().map(|e| e.unwrap().data).collect()
    }

    #[tokio::test]
    async fn test_single_event() {
        let events = collect(&["data: hello\n\n"]).await;
        assert_eq!(data(events), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_event_split_across_chunks() {
        let events = collect(&["da", "ta: {\"a\":", "1}\r\n", "\r\ndata: two\n\n"]).await;
        assert_eq!(data(events), vec!["{\"a\":1}", "two"]);
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_chunks() {
        // "é" is 0xC3 0xA9
        let events = collect_bytes(vec![
            Bytes::from_static(b"data: caf\xC3"),
            Bytes::from_static(b"\xA9\n\n"),
        ])
        .await;
        assert_eq!(data(events), vec!["café"]);
    }

    #[tokio::test]
    async fn test_comments_and_fields() {
        let events = collect(&[": keep-alive\nevent: delta\nid: 7\ndata: a\ndata: b\n\n"]).await;
        let event = events.into_iter().next().unwrap().unwrap();
        assert_eq!(event.event.as_deref(), Some("delta"));
        assert_eq!(event.id.as_deref(), Some("7"));
        assert_eq!(event.data, "a\nb");
    }

    #[tokio::test]
    async fn test_trailing_event_without_blank_line() {
        let events = collect(&["data: first\n\ndata: [DONE]"]).await;
        assert_eq!(data(events), vec!["first", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_stream_error_is_surfaced_once() {
        let source = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: ok\n\n")),
            Err(std::io::Error::other("reset")),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ]);
        let events: Vec<_> = parse_sse_bytes(source).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().data, "ok");
        assert!(events[1].as_ref().unwrap_err().to_string().contains("reset"));
    }
}
