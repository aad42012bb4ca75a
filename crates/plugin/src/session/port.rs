//! Port-forwarding session handler.
//!
//! Three forwarding modes share one handler:
//!
//! - **standard stream**: stdin/stdout bridged straight onto the channel
//! - **basic**: a local TCP or Unix listener, one connection at a time,
//!   with a disconnect flag and re-accept when the local peer drops
//! - **mux**: many concurrent local connections multiplexed over the
//!   channel ([`crate::session::mux`]), used for `LocalPortForwarding`
//!   against agents that speak the mux protocol

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use protocol::error::{ProtocolError, Result};
use protocol::message::{PayloadType, PayloadTypeFlag};

use crate::config;
use crate::datachannel::DataChannel;
use crate::session::mux::MuxPortForwarding;
use crate::session::{SessionContext, SessionHandler};

/// Session properties of a `Port` session, as sent by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PortParameters {
    #[serde(rename = "portNumber")]
    pub port_number: String,
    #[serde(rename = "localPortNumber")]
    pub local_port_number: String,
    #[serde(rename = "localUnixSocket")]
    pub local_unix_socket: String,
    #[serde(rename = "localConnectionType")]
    pub local_connection_type: String,
    #[serde(rename = "type")]
    pub forwarding_type: String,
}

/// One of the three forwarding strategies behind [`PortSession`].
#[async_trait]
pub(crate) trait PortForwarder: Send + Sync {
    /// Writes one inbound payload toward the local peer. Returns `false`
    /// while the local stream is not established so the frame stays
    /// unacknowledged and the agent retransmits it.
    fn write_stream(&self, payload: &[u8]) -> Result<bool>;

    /// Accepts local traffic and pumps it into the channel until the
    /// session ends.
    async fn run(&self, context: &SessionContext) -> Result<()>;

    fn stop(&self);

    fn on_reconnect(&self) {}
}

/// Session handler for `Port` sessions.
#[derive(Default)]
pub struct PortSession {
    forwarder: StdMutex<Option<Arc<dyn PortForwarder>>>,
}

impl PortSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_forwarder(&self) -> Option<Arc<dyn PortForwarder>> {
        self.forwarder.lock().expect("forwarder lock").clone()
    }
}

#[async_trait]
impl SessionHandler for PortSession {
    fn name(&self) -> &'static str {
        config::PORT_PLUGIN_NAME
    }

    fn initialize(&self, context: &SessionContext) -> Result<()> {
        let parameters: PortParameters = if context.session_properties.is_null() {
            PortParameters::default()
        } else {
            serde_json::from_value(context.session_properties.clone()).map_err(|e| {
                ProtocolError::Deserialization(format!("invalid port session properties: {e}"))
            })?
        };

        let forwarder: Arc<dyn PortForwarder> =
            if parameters.forwarding_type == config::LOCAL_PORT_FORWARDING_TYPE
                && agent_supports_mux(&context.agent_version)
            {
                Arc::new(MuxPortForwarding::new(parameters.clone()))
            } else if parameters.forwarding_type == config::LOCAL_PORT_FORWARDING_TYPE {
                Arc::new(BasicPortForwarding::new(parameters.clone()))
            } else {
                Arc::new(StandardStreamForwarding::new(parameters.clone()))
            };
        *self.forwarder.lock().expect("forwarder lock") = Some(forwarder.clone());

        let handler_forwarder = forwarder;
        context.data_channel.register_output_stream_handler(
            Arc::new(move |_channel, message| handler_forwarder.write_stream(&message.payload)),
            true,
        );
        info!(
            "connected to instance {} on port {}",
            context.target_id, parameters.port_number
        );
        Ok(())
    }

    async fn run(&self, context: &SessionContext) -> Result<()> {
        let forwarder = self
            .current_forwarder()
            .ok_or_else(|| ProtocolError::Handshake("port session not initialized".to_string()))?;
        forwarder.run(context).await
    }

    fn stop(&self) {
        if let Some(forwarder) = self.current_forwarder() {
            forwarder.stop();
        }
    }

    fn on_reconnect(&self) {
        if let Some(forwarder) = self.current_forwarder() {
            forwarder.on_reconnect();
        }
    }
}

/// Whether the agent is new enough to multiplex port-forwarding streams.
pub(crate) fn agent_supports_mux(agent_version: &str) -> bool {
    version_at_least(agent_version, config::MUX_SUPPORTED_AGENT_VERSION)
}

/// Compares dotted numeric versions component-wise. Unparsable versions
/// count as older.
fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Option<Vec<u64>> {
        v.split('.').map(|part| part.parse::<u64>().ok()).collect()
    };
    match (parse(version), parse(minimum)) {
        (Some(version), Some(minimum)) => {
            let width = version.len().max(minimum.len());
            for i in 0..width {
                let a = version.get(i).copied().unwrap_or(0);
                let b = minimum.get(i).copied().unwrap_or(0);
                if a != b {
                    return a > b;
                }
            }
            true
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Standard stream forwarding
// ---------------------------------------------------------------------------

/// Bridges stdin/stdout onto the data channel.
pub struct StandardStreamForwarding {
    parameters: PortParameters,
    ready: AtomicBool,
    data_channel: StdMutex<Option<Arc<DataChannel>>>,
}

impl StandardStreamForwarding {
    pub fn new(parameters: PortParameters) -> Self {
        Self {
            parameters,
            ready: AtomicBool::new(false),
            data_channel: StdMutex::new(None),
        }
    }
}

#[async_trait]
impl PortForwarder for StandardStreamForwarding {
    fn write_stream(&self, payload: &[u8]) -> Result<bool> {
        if !self.ready.load(Ordering::SeqCst) {
            debug!("waiting for streams to be established before processing incoming messages");
            return Ok(false);
        }
        let mut stdout = std::io::stdout();
        std::io::Write::write_all(&mut stdout, payload)?;
        std::io::Write::flush(&mut stdout)?;
        Ok(true)
    }

    async fn run(&self, context: &SessionContext) -> Result<()> {
        *self.data_channel.lock().expect("data channel lock") =
            Some(context.data_channel.clone());
        self.ready.store(true, Ordering::SeqCst);
        spawn_terminate_on_interrupt(context.data_channel.clone(), false);

        let data_channel = context.data_channel.clone();
        let mut stdin = tokio::io::stdin();
        let mut buffer = [0u8; config::STREAM_DATA_PAYLOAD_SIZE];
        loop {
            tokio::select! {
                _ = data_channel.wait_for_session_ended() => return Ok(()),
                read = stdin.read(&mut buffer) => match read {
                    Ok(0) => {
                        info!(
                            "session to instance {} on port {} was closed",
                            context.target_id, self.parameters.port_number
                        );
                        return Ok(());
                    }
                    Ok(n) => {
                        data_channel
                            .send_input_data(PayloadType::Output, &buffer[..n])
                            .await?;
                        tokio::time::sleep(config::READ_SLEEP_INTERVAL).await;
                    }
                    Err(e) => {
                        error!("reading input failed: {e}");
                        return Err(e.into());
                    }
                },
            }
        }
    }

    fn stop(&self) {
        if let Some(channel) = self.data_channel.lock().expect("data channel lock").clone() {
            channel.end_session();
        }
    }
}

// ---------------------------------------------------------------------------
// Basic port forwarding
// ---------------------------------------------------------------------------

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local listener accepting the connections to forward.
pub(crate) enum LocalListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl LocalListener {
    /// Binds per the session parameters: a Unix socket when requested, else
    /// TCP on localhost (port 0 when none was asked for). Returns the bound
    /// TCP port, if any.
    pub(crate) async fn bind(
        parameters: &PortParameters,
        session_id: &str,
    ) -> Result<(Self, Option<u16>)> {
        #[cfg(unix)]
        if parameters.local_connection_type == "unix" {
            let listener = tokio::net::UnixListener::bind(&parameters.local_unix_socket)?;
            info!(
                "unix socket {} opened for session {}",
                parameters.local_unix_socket, session_id
            );
            return Ok((LocalListener::Unix(listener), None));
        }

        // No local port requested means the OS picks one.
        let port = if parameters.local_port_number.is_empty() {
            "0"
        } else {
            &parameters.local_port_number
        };
        let listener = TcpListener::bind(format!("localhost:{port}")).await?;
        let local_port = listener.local_addr()?.port();
        info!("port {local_port} opened for session {session_id}");
        Ok((LocalListener::Tcp(listener), Some(local_port)))
    }

    pub(crate) async fn accept(&self) -> std::io::Result<(BoxedReader, BoxedWriter)> {
        match self {
            LocalListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
            #[cfg(unix)]
            LocalListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                let (reader, writer) = stream.into_split();
                Ok((Box::new(reader), Box::new(writer)))
            }
        }
    }
}

/// Forwards one local connection at a time over the channel. When the local
/// peer drops, the agent is told to close its side and the listener accepts
/// the next connection on the same channel.
pub struct BasicPortForwarding {
    parameters: PortParameters,
    writer_tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    bound_port: StdMutex<Option<u16>>,
    data_channel: StdMutex<Option<Arc<DataChannel>>>,
}

impl BasicPortForwarding {
    pub fn new(parameters: PortParameters) -> Self {
        Self {
            parameters,
            writer_tx: StdMutex::new(None),
            bound_port: StdMutex::new(None),
            data_channel: StdMutex::new(None),
        }
    }

    /// Port the TCP listener actually bound, once listening.
    pub fn bound_port(&self) -> Option<u16> {
        *self.bound_port.lock().expect("bound port lock")
    }

    async fn start_local_listener(&self, session_id: &str) -> Result<LocalListener> {
        let (listener, port) = LocalListener::bind(&self.parameters, session_id).await?;
        *self.bound_port.lock().expect("bound port lock") = port;
        Ok(listener)
    }

    /// Accepts one connection, wires its write half to the inbound payload
    /// queue, and returns the read half.
    async fn accept_connection(
        &self,
        listener: &LocalListener,
        data_channel: &Arc<DataChannel>,
        session_id: &str,
    ) -> Result<Option<BoxedReader>> {
        let accepted = tokio::select! {
            _ = data_channel.wait_for_session_ended() => return Ok(None),
            accepted = listener.accept() => accepted,
        };
        let (reader, mut writer) = match accepted {
            Ok(halves) => halves,
            Err(e) => {
                if data_channel.is_session_ended() {
                    return Ok(None);
                }
                error!("failed to accept connection: {e}");
                return Err(e.into());
            }
        };
        info!("connection accepted for session {session_id}");

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.writer_tx.lock().expect("writer lock") = Some(writer_tx);
        tokio::spawn(async move {
            while let Some(payload) = writer_rx.recv().await {
                if writer.write_all(&payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(Some(reader))
    }
}

#[async_trait]
impl PortForwarder for BasicPortForwarding {
    fn write_stream(&self, payload: &[u8]) -> Result<bool> {
        let writer = self.writer_tx.lock().expect("writer lock").clone();
        match writer {
            Some(tx) => Ok(tx.send(payload.to_vec()).is_ok()),
            None => {
                debug!("waiting for a local connection before processing incoming messages");
                Ok(false)
            }
        }
    }

    async fn run(&self, context: &SessionContext) -> Result<()> {
        *self.data_channel.lock().expect("data channel lock") =
            Some(context.data_channel.clone());
        let data_channel = context.data_channel.clone();
        spawn_terminate_on_interrupt(data_channel.clone(), true);

        let listener = self.start_local_listener(&context.session_id).await?;
        let Some(mut reader) = self
            .accept_connection(&listener, &data_channel, &context.session_id)
            .await?
        else {
            return Ok(());
        };

        let mut buffer = [0u8; config::STREAM_DATA_PAYLOAD_SIZE];
        loop {
            let read = tokio::select! {
                _ = data_channel.wait_for_session_ended() => return Ok(()),
                read = reader.read(&mut buffer) => read,
            };
            match read {
                Ok(n) if n > 0 => {
                    data_channel
                        .send_input_data(PayloadType::Output, &buffer[..n])
                        .await?;
                    tokio::time::sleep(config::READ_SLEEP_INTERVAL).await;
                }
                // EOF or error: the local peer went away. Tell the agent to
                // drop its server-side connection and accept a new one on
                // the same channel.
                result => {
                    if data_channel.is_session_ended() {
                        return Ok(());
                    }
                    if let Err(e) = result {
                        debug!(
                            "reading from port {} failed: {e}; accepting a new connection",
                            self.parameters.port_number
                        );
                    }
                    *self.writer_tx.lock().expect("writer lock") = None;
                    data_channel.send_flag(PayloadTypeFlag::DisconnectToPort).await?;
                    match self
                        .accept_connection(&listener, &data_channel, &context.session_id)
                        .await?
                    {
                        Some(new_reader) => reader = new_reader,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn stop(&self) {
        *self.writer_tx.lock().expect("writer lock") = None;
        if let Some(channel) = self.data_channel.lock().expect("data channel lock").clone() {
            channel.end_session();
        }
    }
}

/// Ends the session when the user interrupts the forwarder, optionally
/// telling the agent to terminate first.
pub(crate) fn spawn_terminate_on_interrupt(data_channel: Arc<DataChannel>, send_flag: bool) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("terminate signal received, exiting");
        if send_flag {
            if let Err(e) = data_channel.send_flag(PayloadTypeFlag::TerminateSession).await {
                error!("failed to send TerminateSession flag: {e}");
            }
        }
        info!(
            "exiting session with session id {}",
            data_channel.session_id()
        );
        data_channel.end_session();
    });
}
