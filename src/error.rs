use thiserror::Error;

/// Request-level failures. Each variant maps to exactly one HTTP status; the
/// message is what the client sees in `{"error": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Missing or malformed request field.
    #[error("{0}")]
    Validation(String),

    /// Request body over the configured upload limit.
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Audio could not be decoded or the speech model failed.
    #[error("{0}")]
    Transcription(String),

    /// Uploaded bytes are not a decodable image.
    #[error("{0}")]
    ImageDecode(String),

    /// Model-internal failure (text embedder, vision encoder, worker task).
    #[error("{0}")]
    Inference(String),
}

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Flatten an anyhow chain ("outer: inner: root") without a backtrace.
    pub fn transcription(err: &anyhow::Error) -> Self {
        Self::Transcription(format!("{err:#}"))
    }

    pub fn inference(err: &anyhow::Error) -> Self {
        Self::Inference(format!("{err:#}"))
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::PayloadTooLarge(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Transcription(_) => "transcription",
            Self::ImageDecode(_) => "image_decode",
            Self::Inference(_) => "inference",
        }
    }
}
