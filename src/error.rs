//! Error types for the screen commentary client

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Single human-readable line for the user-facing layer.
    pub fn user_message(&self) -> String {
        match self {
            Error::Capture(CaptureError::Denied(_)) => {
                "Screen sharing permission was denied".to_string()
            }
            Error::Capture(CaptureError::Unavailable(_)) => {
                "No screen is available to share".to_string()
            }
            Error::Capture(e) => format!("Screen capture failed: {}", e),
            Error::Transport(_) => "Connection to the commentary service failed".to_string(),
            Error::Session(SessionError::AlreadyActive) => {
                "A session is already running".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Screen acquisition and sampling errors
#[derive(Error, Debug, Clone)]
pub enum CaptureError {
    #[error("Screen capture permission denied: {0}")]
    Denied(String),

    #[error("No screen source available: {0}")]
    Unavailable(String),

    #[error("Screen source ended")]
    SourceEnded,

    #[error("Snapshot encoding failed: {0}")]
    Encode(String),

    #[error("Capture backend error: {0}")]
    Backend(String),
}

/// Duplex channel errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Channel closed{}", .0.as_deref().map(|r| format!(": {}", r)).unwrap_or_default())]
    Closed(Option<String>),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Audio fragment decode errors
#[derive(Error, Debug, Clone)]
pub enum DecodeError {
    #[error("Invalid payload encoding: {0}")]
    InvalidPayload(String),

    #[error("Unsupported audio format: {0}")]
    Unsupported(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Fragment contains no audio")]
    Empty,
}

/// Audio output errors
#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("A capture session is already active")]
    AlreadyActive,

    #[error("No capture session is active")]
    NotActive,

    #[error("Session task failed: {0}")]
    TaskFailed(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
