use thiserror::Error;

/// All errors produced by voicebridge-core.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("malformed audio chunk: {0}")]
    MalformedChunk(String),

    #[error("capture is already running")]
    AlreadyRunning,

    #[error("playback engine is not initialized")]
    NotInitialized,

    #[error("playback engine has been stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Whether this error came from acquiring hardware (as opposed to bad input).
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied | Self::DeviceUnavailable(_) | Self::AudioStream(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
