//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes of the data
/// channel: frame parsing, digest validation, transport I/O, handshake
/// processing, and envelope encryption.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Frame errors
    /// A frame field could not be read or written at its fixed offset.
    #[error("malformed frame: {0}")]
    Format(String),

    /// The payload digest did not match the payload bytes.
    #[error("payload integrity check failed: {0}")]
    Integrity(String),

    // Serialization errors
    /// Failed to serialize a JSON payload.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a JSON payload.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Transport errors
    /// WebSocket I/O failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote side closed the channel.
    #[error("channel closed by remote: {0}")]
    RemoteClose(String),

    // Handshake errors
    /// A handshake action could not be processed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    // Crypto errors
    /// Envelope encryption or decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Fetching the KMS data key failed.
    #[error("data key generation failed: {0}")]
    DataKey(String),

    // Delivery errors
    /// The head of the outgoing buffer was retransmitted past the cap
    /// without being acknowledged.
    #[error("stream message resend timed out after {attempts} attempts (sequence number {sequence_number})")]
    SequenceTimeout {
        /// Sequence number of the unacknowledged message.
        sequence_number: i64,
        /// Number of resend attempts made.
        attempts: u32,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::RemoteClose(err.to_string()),
            _ => ProtocolError::Transport(err.to_string()),
        }
    }
}
