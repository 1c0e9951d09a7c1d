//! Error types for the streaming client

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture stream failed: {0}")]
    StreamError(String),
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("No supported codec among: {0}")]
    EncodingUnsupported(String),

    #[error("Encoding chunk {sequence} failed: {reason}")]
    EncodeError { sequence: u64, reason: String },

    #[error("Encoder failed after {consecutive} consecutive errors")]
    EncoderFailure { consecutive: u32 },

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),
}

impl CodecError {
    /// Whether this error ends the chunk stream
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::EncodeError { .. } | CodecError::DecodingFailed(_))
    }
}

/// Network errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send queue full")]
    Backpressure,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Malformed inbound message: {0}")]
    ReceiveError(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection closed abnormally (code {code})")]
    AbnormalClosure { code: u16 },
}

/// Playback timeline errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Append rejected: {reason}")]
    BufferAppendRejected { reason: &'static str },
}

/// Session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("A session is already active")]
    AlreadyActive,

    #[error("Connection not established within {waited_ms} ms")]
    StartupTimeout { waited_ms: u64 },

    #[error("Start was cancelled by a stop request")]
    StartCancelled,

    #[error("Gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Capture ended unexpectedly")]
    CaptureEnded,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
