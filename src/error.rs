//! Error types for the KMS.
//!
//! Every error carries a stable string code and a numeric code. The numeric
//! code is what a consensus node sees in a `RemoteSignerError`; the string
//! code is what shows up in logs.

use thiserror::Error;

use crate::config::Role;
use crate::protocol::RemoteSignerError;
use crate::signing::types::Hrs;

/// KMS error type.
#[derive(Error, Debug)]
pub enum KmsError {
    // Key material errors
    #[error("Key load failed: {0}")]
    KeyLoad(String),

    // Watermark errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("State file corrupt: {0}")]
    StateCorrupt(String),

    #[error("Signer state lock poisoned")]
    StatePoisoned,

    #[error("Double-sign attempt: requested {requested} does not exceed last signed {stored}")]
    DoubleSign { requested: Hrs, stored: Hrs },

    // Authority errors
    #[error("Signer not active for {0} endpoint")]
    NotActive(Role),

    // Signing errors
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    // Input validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Transport errors
    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Frame too large: {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Peer identity mismatch: expected {expected}, got {actual}")]
    PeerMismatch { expected: String, actual: String },

    #[error("Channel closed by peer")]
    ChannelClosed,

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KmsError {
    /// Get the error code for structured logs and remote error descriptions.
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::KeyLoad(_) => Some("KEY_LOAD_FAILED"),
            Self::Storage(_) => Some("STORAGE_ERROR"),
            Self::StateCorrupt(_) => Some("STATE_CORRUPT"),
            Self::StatePoisoned => Some("STATE_POISONED"),
            Self::DoubleSign { .. } => Some("DOUBLE_SIGN"),
            Self::NotActive(_) => Some("SIGNER_NOT_ACTIVE"),
            Self::SigningFailed(_) => Some("SIGNING_FAILED"),
            Self::InvalidInput(_) => Some("INVALID_INPUT"),
            Self::Dial(_) => Some("DIAL_FAILED"),
            Self::Handshake(_) => Some("HANDSHAKE_FAILED"),
            Self::Transport(_) => Some("TRANSPORT_ERROR"),
            Self::FrameTooLarge { .. } => Some("FRAME_TOO_LARGE"),
            Self::PeerMismatch { .. } => Some("PEER_MISMATCH"),
            Self::ChannelClosed => Some("CHANNEL_CLOSED"),
            Self::Serialization(_) => Some("SERIALIZATION_ERROR"),
            Self::Deserialization(_) => Some("DESERIALIZATION_ERROR"),
            Self::Config(_) => Some("CONFIG_ERROR"),
            Self::Internal(_) => None, // Don't expose internal error codes
        }
    }

    /// Numeric code carried in `RemoteSignerError.code`.
    pub fn remote_code(&self) -> i32 {
        match self {
            // 1 - the request itself is unusable
            Self::InvalidInput(_) | Self::Serialization(_) | Self::Deserialization(_) => 1,

            // 2 - refused by the watermark
            Self::DoubleSign { .. } => 2,

            // 3 - refused by the authority
            Self::NotActive(_) => 3,

            // 4 - the key could not produce a signature
            Self::SigningFailed(_) => 4,

            // 5 - the signer cannot vouch for its own state
            Self::KeyLoad(_)
            | Self::Storage(_)
            | Self::StateCorrupt(_)
            | Self::StatePoisoned
            | Self::Config(_) => 5,

            // 6 - channel-level problems
            Self::Dial(_)
            | Self::Handshake(_)
            | Self::Transport(_)
            | Self::FrameTooLarge { .. }
            | Self::PeerMismatch { .. }
            | Self::ChannelClosed => 6,

            Self::Internal(_) => 99,
        }
    }

    /// Errors after which the process must stop instead of retrying.
    ///
    /// Signing on top of a watermark that could not be read or written
    /// would reopen the double-sign window. A poisoned state lock means a
    /// sign operation panicked midway, so the in-memory watermark is no
    /// longer trusted either.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_)
                | Self::StateCorrupt(_)
                | Self::StatePoisoned
                | Self::KeyLoad(_)
                | Self::Config(_)
        )
    }

    /// Errors that only invalidate the current channel.
    pub fn is_transport(&self) -> bool {
        self.remote_code() == 6
    }

    /// Build the error payload returned to the consensus node.
    pub fn to_remote_error(&self) -> RemoteSignerError {
        let description = match self.error_code() {
            Some(code) => format!("{code}: {self}"),
            None => "internal error".to_string(),
        };
        RemoteSignerError {
            code: self.remote_code(),
            description,
        }
    }
}

// Conversion from common error types

impl From<std::io::Error> for KmsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => Self::ChannelClosed,
            _ => Self::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for KmsError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Deserialization(err.to_string())
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

impl From<prost::DecodeError> for KmsError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Deserialization(err.to_string())
    }
}

/// Result type alias for KMS operations.
pub type KmsResult<T> = Result<T, KmsError>;
