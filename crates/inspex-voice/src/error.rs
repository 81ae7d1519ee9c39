//! Error types for the live voice session engine

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while running a live voice session
#[derive(Error, Debug)]
pub enum VoiceError {
    /// The transport never reached the Live state
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// The setup acknowledgment never arrived
    #[error("Session setup rejected: {0}")]
    SetupRejected(String),

    /// Zero/invalid sample rate or the audio engine failed to start
    #[error("Audio hardware unavailable: {0}")]
    AudioHardwareUnavailable(String),

    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    /// Downlink audio payload was empty or not a whole number of samples
    #[error("Empty audio payload ({len} bytes)")]
    EmptyPayload { len: usize },

    /// Send queue saturated with messages that may not be dropped
    #[error("Send queue overflow, discarded {0} message")]
    SendOverflow(&'static str),

    #[error("Malformed inbound message: {0}")]
    MalformedInbound(String),

    #[error("Tool '{tool}' failed: {reason}")]
    ToolDispatchFailure { tool: String, reason: String },

    #[error("Connection lost: {0}")]
    UnexpectedDisconnect(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    /// Whether this error ends the session it occurred in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VoiceError::ConnectFailed(_)
                | VoiceError::SetupRejected(_)
                | VoiceError::AudioHardwareUnavailable(_)
                | VoiceError::UnexpectedDisconnect(_)
        )
    }

    /// Assistant-style status line shown to the inspector once when a
    /// session-affecting error occurs.
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::ConnectFailed(_) => {
                "I couldn't reach the voice service. Check your connection and try again.".to_string()
            }
            VoiceError::SetupRejected(_) => {
                "The voice service didn't accept the session. Check the API key and try again.".to_string()
            }
            VoiceError::AudioHardwareUnavailable(_) => {
                "The microphone isn't available right now.".to_string()
            }
            VoiceError::UnexpectedDisconnect(_) => {
                "The voice connection dropped. Start a new session to continue.".to_string()
            }
            other => format!("Something went wrong: {other}"),
        }
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Http(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::UnexpectedDisconnect(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioHardwareUnavailable(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioHardwareUnavailable(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioHardwareUnavailable(err.to_string())
    }
}
