//! Error types for the parley pipeline.

/// Top-level error type for the voice conversation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Audio ingest or PCM conversion error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech recognition service error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Language model service error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech service error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Audio transport (WebSocket) error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Session lifecycle error.
    #[error("session error: {0}")]
    Session(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// An external call exceeded its deadline.
    #[error("{stage} timed out after {millis}ms")]
    Timeout {
        /// Pipeline stage that timed out.
        stage: &'static str,
        /// Deadline that was exceeded.
        millis: u64,
    },

    /// Work was cancelled (barge-in or shutdown).
    #[error("cancelled")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSeverity {
    /// A single ASR/LLM/TTS call failed; handled inside the stage.
    Transient,
    /// The session cannot continue and must be torn down.
    SessionFatal,
}

impl VoiceError {
    /// Classify this error for propagation decisions.
    pub fn severity(&self) -> FailureSeverity {
        match self {
            Self::Config(_) | Self::Transport(_) | Self::Session(_) | Self::Io(_) => {
                FailureSeverity::SessionFatal
            }
            Self::Audio(_)
            | Self::Asr(_)
            | Self::Llm(_)
            | Self::Tts(_)
            | Self::Channel(_)
            | Self::Timeout { .. }
            | Self::Cancelled => FailureSeverity::Transient,
        }
    }

    /// Whether retrying the same call might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Tts(_) | Self::Asr(_) | Self::Llm(_) | Self::Timeout { .. }
        )
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
