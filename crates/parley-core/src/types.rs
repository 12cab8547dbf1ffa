use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// How the bytes of an [`AudioFrame`] are encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Compressed container stream (e.g. "webm") that must be decoded first.
    Container(String),
    /// Raw mono 16-bit little-endian PCM.
    Pcm16,
}

impl AudioEncoding {
    /// Map a client-supplied encoding label ("audio/wav", "pcm_s16le", "audio/webm", ...).
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_ascii_lowercase();
        let format = label.strip_prefix("audio/").unwrap_or(&label);
        match format {
            "wav" | "x-wav" | "wave" | "pcm" | "l16" | "pcm_s16le" | "s16le" => AudioEncoding::Pcm16,
            other => AudioEncoding::Container(other.split(';').next().unwrap_or(other).to_string()),
        }
    }
}

/// One unit of inbound audio. Owned by exactly one consumer at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Bytes,
    pub encoding: AudioEncoding,
    /// Sample rate, when the client declared one.
    pub sample_rate: Option<u32>,
}

impl AudioFrame {
    pub fn container(data: impl Into<Bytes>, format: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            encoding: AudioEncoding::Container(format.into()),
            sample_rate: None,
        }
    }

    pub fn pcm(data: impl Into<Bytes>, sample_rate: u32) -> Self {
        Self {
            data: data.into(),
            encoding: AudioEncoding::Pcm16,
            sample_rate: Some(sample_rate),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether this frame can go to STT as-is at `target_rate`.
    pub fn is_ready_pcm(&self, target_rate: u32) -> bool {
        self.encoding == AudioEncoding::Pcm16
            && self.sample_rate.is_none_or(|rate| rate == target_rate)
    }
}

/// Strip a RIFF/WAVE header, returning the `data` chunk payload.
/// Input without a RIFF header is returned unchanged.
pub fn strip_wav_header(data: Bytes) -> Bytes {
    if data.len() < 12 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return data;
    }
    let mut pos = 12;
    while pos + 8 <= data.len() {
        let id = &data[pos..pos + 4];
        let size = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]])
            as usize;
        let body = pos + 8;
        if id == b"data" {
            let end = body.saturating_add(size).min(data.len());
            return data.slice(body..end);
        }
        pos = body.saturating_add(size + (size & 1));
    }
    Bytes::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + payload.len() as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&[1, 0, 1, 0]);
        out.extend_from_slice(&16_000u32.to_le_bytes());
        out.extend_from_slice(&32_000u32.to_le_bytes());
        out.extend_from_slice(&[2, 0, 16, 0]);
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_encoding_from_label() {
        assert_eq!(AudioEncoding::from_label("audio/wav"), AudioEncoding::Pcm16);
        assert_eq!(AudioEncoding::from_label("pcm_s16le"), AudioEncoding::Pcm16);
        assert_eq!(
            AudioEncoding::from_label("audio/webm;codecs=opus"),
            AudioEncoding::Container("webm".into())
        );
        assert_eq!(
            AudioEncoding::from_label("ogg"),
            AudioEncoding::Container("ogg".into())
        );
    }

    #[test]
    fn test_ready_pcm() {
        assert!(AudioFrame::pcm(vec![0u8; 4], 16_000).is_ready_pcm(16_000));
        assert!(!AudioFrame::pcm(vec![0u8; 4], 48_000).is_ready_pcm(16_000));
        assert!(!AudioFrame::container(vec![0u8; 4], "webm").is_ready_pcm(16_000));
    }

    #[test]
    fn test_strip_wav_header() {
        let payload = [1u8, 2, 3, 4, 5, 6];
        let stripped = strip_wav_header(Bytes::from(wav(&payload)));
        assert_eq!(&stripped[..], &payload);
    }

    #[test]
    fn test_strip_wav_header_passthrough() {
        let raw = Bytes::from_static(&[9, 8, 7, 6]);
        assert_eq!(strip_wav_header(raw.clone()), raw);
    }
}
