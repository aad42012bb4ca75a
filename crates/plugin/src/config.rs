//! Protocol tunables and plugin identifiers.
//!
//! The delivery constants mirror what the managed-session service expects
//! from clients; the RTO seeds are chosen so the initial timeout covers at
//! least one network round trip.

use std::time::Duration;

/// Role string announced when the channel is opened.
pub const ROLE_PUBLISH_SUBSCRIBE: &str = "publish_subscribe";

/// Schema version of the `OpenDataChannelInput` text frame.
pub const MESSAGE_SCHEMA_VERSION: &str = "1.0";

/// Outgoing messages kept for retransmission until acknowledged.
pub const OUTGOING_MESSAGE_BUFFER_CAPACITY: usize = 10000;

/// Out-of-order inbound frames held for reassembly.
pub const INCOMING_MESSAGE_BUFFER_CAPACITY: usize = 10000;

/// Seed for the smoothed round-trip time estimate.
pub const DEFAULT_ROUND_TRIP_TIME: Duration = Duration::from_millis(100);

/// Seed for the round-trip time variation estimate, in seconds.
pub const DEFAULT_ROUND_TRIP_TIME_VARIATION: f64 = 0.0;

/// Retransmission timeout before the first RTT sample arrives.
pub const DEFAULT_TRANSMISSION_TIMEOUT: Duration = Duration::from_millis(200);

/// Upper bound on the adaptive retransmission timeout.
pub const MAX_TRANSMISSION_TIMEOUT: Duration = Duration::from_secs(1);

/// Lower bound on the variation term of the RTO formula.
pub const CLOCK_GRANULARITY: Duration = Duration::from_millis(10);

/// How often the resend scheduler inspects the outgoing buffer.
pub const RESEND_SLEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Consecutive resends of the head message before the channel gives up.
pub const RESEND_MAX_ATTEMPT: u32 = 3000;

/// Smoothing factor applied to new RTT samples (Jacobson/Karels alpha).
pub const RTT_CONSTANT: f64 = 1.0 / 8.0;

/// Smoothing factor applied to RTT deviation samples (Jacobson/Karels beta).
pub const RTTV_CONSTANT: f64 = 1.0 / 4.0;

/// Largest chunk read from a local stream per data message.
pub const STREAM_DATA_PAYLOAD_SIZE: usize = 1024;

/// Largest chunk read from the keyboard per data message.
pub const STDIN_BUFFER_LIMIT: usize = 1024;

/// How often the shell session polls the terminal for size changes.
pub const RESIZE_SLEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Pause between local stream reads so the channel can drain.
pub const READ_SLEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Session type implemented by the interactive shell handler.
pub const SHELL_PLUGIN_NAME: &str = "Standard_Stream";

/// Session type implemented by the port-forwarding handler.
pub const PORT_PLUGIN_NAME: &str = "Port";

/// Interactive command sessions run through the shell handler.
pub const INTERACTIVE_COMMANDS_PLUGIN_NAME: &str = "InteractiveCommands";

/// Non-interactive command sessions also run through the shell handler.
pub const NON_INTERACTIVE_COMMANDS_PLUGIN_NAME: &str = "NonInteractiveCommands";

/// Port-session subtype that multiplexes many local connections.
pub const LOCAL_PORT_FORWARDING_TYPE: &str = "LocalPortForwarding";

/// First agent version whose port sessions speak the mux protocol.
pub const MUX_SUPPORTED_AGENT_VERSION: &str = "2.3.672.0";

/// Growth ratio of the reconnect backoff.
pub const RETRY_BASE: f64 = 2.0;

/// Initial reconnect delay.
pub const DATA_CHANNEL_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Ceiling on the reconnect delay.
pub const DATA_CHANNEL_RETRY_MAX_INTERVAL: Duration = Duration::from_millis(5000);

/// Reconnect attempts before giving up.
pub const DATA_CHANNEL_NUM_MAX_RETRIES: u32 = 5;

/// Operation name this binary handles.
pub const START_SESSION_OPERATION: &str = "StartSession";

/// Client version reported during handshake when argv does not supply one.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
