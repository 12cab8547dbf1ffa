use std::fmt;

use thiserror::Error;

/// External collaborator a vendor error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Stt,
    Llm,
    Tts,
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Vendor::Stt => "stt",
            Vendor::Llm => "llm",
            Vendor::Tts => "tts",
        })
    }
}

#[derive(Debug, Error)]
pub enum ParleyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{vendor} connect error: {message}")]
    VendorConnect { vendor: Vendor, message: String },

    #[error("{vendor} protocol error: {message}")]
    VendorProtocol { vendor: Vendor, message: String },

    #[error("Transcoder error: {0}")]
    Transcoder(String),

    #[error("Transcoder died: {0}")]
    TranscoderDied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ParleyError {
    /// Whether this error terminates the whole session rather than one turn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ParleyError::Transport(_)
                | ParleyError::TranscoderDied(_)
                | ParleyError::VendorConnect {
                    vendor: Vendor::Stt,
                    ..
                }
        )
    }

    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            ParleyError::Config(_) => "config",
            ParleyError::Transport(_) => "transport",
            ParleyError::VendorConnect { .. } => "vendor_connect",
            ParleyError::VendorProtocol { .. } => "vendor_protocol",
            ParleyError::Transcoder(_) => "transcoder",
            ParleyError::TranscoderDied(_) => "transcoder_died",
            ParleyError::Validation(_) => "validation",
            ParleyError::Io(_) => "io",
            ParleyError::Json(_) => "json",
            ParleyError::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, ParleyError>;
