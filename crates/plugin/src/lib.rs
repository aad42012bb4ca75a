//! # Session Manager plugin
//!
//! Client side of the managed-session data channel: dial a WebSocket to the
//! session service, handshake the session type (optionally with KMS envelope
//! encryption), then exchange a sequenced, acknowledged, binary-framed
//! message stream between the local machine and the remote agent.
//!
//! Two session flavors terminate on top of the channel: an interactive shell
//! and port forwarding (single-connection or multiplexed).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                    Session                        │
//! │   registry → shell / port / mux handler           │
//! ├───────────────────────────────────────────────────┤
//! │                  DataChannel                      │
//! │   sequencing · ACKs · retransmission · handshake  │
//! ├───────────────────────────────────────────────────┤
//! │               WebSocketChannel                    │
//! │   serialized writes · reader task · reconnect     │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: protocol constants and plugin identifiers
//! - [`websocket`]: the WebSocket transport
//! - [`datachannel`]: reliable delivery and the handshake state machine
//! - [`session`]: session lifecycle, registry, and handlers
//! - [`sdk`]: the narrow seam to SSM and KMS

pub mod config;
pub mod datachannel;
pub mod sdk;
pub mod session;
pub mod websocket;

pub use datachannel::{DataChannel, DataChannelConfig, Dispatch};
pub use session::{Session, SessionContext, SessionHandler, SessionParams, SessionRegistry};
pub use websocket::{Transport, TransportEvent, WebSocketChannel};
