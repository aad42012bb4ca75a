//! # Session data-channel protocol
//!
//! Wire-level building blocks for the managed-session data channel:
//!
//! - **Frame codec**: the fixed-layout binary client message exchanged over
//!   the WebSocket, with SHA-256 payload digests
//! - **Payloads**: the JSON bodies carried inside frames (acknowledgements,
//!   handshake, channel-closed, terminal size)
//! - **Envelope encryption**: AES-256-GCM keyed by a KMS-issued 64-byte data
//!   key split between the two directions
//! - **Errors**: one error type covering framing, integrity, transport,
//!   handshake, and crypto failures
//!
//! The crate is transport-agnostic; the binary crate supplies the WebSocket,
//! the sequencing engine, and the session handlers on top of it.
//!
//! ## Modules
//!
//! - [`message`]: binary frame codec and type constants
//! - [`payload`]: JSON payload definitions
//! - [`encryption`]: envelope encrypter and the KMS data-key seam
//! - [`error`]: error types

pub mod encryption;
pub mod error;
pub mod message;
pub mod payload;

pub use encryption::{DataKeyProvider, Encrypter, GeneratedDataKey, KMS_KEY_SIZE_IN_BYTES};
pub use error::{ProtocolError, Result};
pub use message::{ClientMessage, PayloadType, PayloadTypeFlag};
