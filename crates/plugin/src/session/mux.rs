//! Virtual-stream multiplexing for port forwarding.
//!
//! `LocalPortForwarding` sessions against mux-capable agents carry many
//! concurrent local TCP connections over the single data channel. Each
//! connection becomes a virtual stream framed with the smux v1 wire format,
//! embedded in the payloads of ordinary `Output` data messages:
//!
//! ```text
//! | version (1) | command (1) | length (2, LE) | stream id (4, LE) | data |
//! ```
//!
//! Commands: SYN opens a stream, FIN closes it, PSH carries data, NOP is a
//! keep-alive. The client opens odd stream ids. Frames may split or
//! coalesce across data messages, so the inbound side reassembles from a
//! running byte buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use protocol::error::Result;
use protocol::message::PayloadType;

use crate::config;
use crate::datachannel::DataChannel;
use crate::session::port::{
    spawn_terminate_on_interrupt, BoxedReader, BoxedWriter, LocalListener, PortForwarder,
    PortParameters,
};
use crate::session::SessionContext;

/// Protocol version in every frame header.
const MUX_VERSION: u8 = 1;

/// Frame header width.
const MUX_HEADER_SIZE: usize = 8;

const CMD_SYN: u8 = 0;
const CMD_FIN: u8 = 1;
const CMD_PSH: u8 = 2;
const CMD_NOP: u8 = 3;

/// One decoded mux frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MuxFrame {
    pub version: u8,
    pub command: u8,
    pub stream_id: u32,
    pub data: Vec<u8>,
}

/// Encodes a frame into its wire form.
fn encode_frame(command: u8, stream_id: u32, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() <= u16::MAX as usize);
    let mut out = Vec::with_capacity(MUX_HEADER_SIZE + data.len());
    out.push(MUX_VERSION);
    out.push(command);
    out.extend_from_slice(&(data.len() as u16).to_le_bytes());
    out.extend_from_slice(&stream_id.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Incremental frame decoder over the payload byte stream.
#[derive(Default)]
pub(crate) struct MuxFrameDecoder {
    buffer: BytesMut,
}

impl MuxFrameDecoder {
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Option<MuxFrame> {
        if self.buffer.len() < MUX_HEADER_SIZE {
            return None;
        }
        let length = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if self.buffer.len() < MUX_HEADER_SIZE + length {
            return None;
        }

        let version = self.buffer[0];
        let command = self.buffer[1];
        let stream_id =
            u32::from_le_bytes([self.buffer[4], self.buffer[5], self.buffer[6], self.buffer[7]]);
        self.buffer.advance(MUX_HEADER_SIZE);
        let data = self.buffer.split_to(length).to_vec();

        Some(MuxFrame {
            version,
            command,
            stream_id,
            data,
        })
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

struct MuxState {
    data_channel: StdMutex<Option<Arc<DataChannel>>>,
    /// Live virtual streams: id to the sender feeding the local writer.
    streams: StdMutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>,
    /// Client-opened stream ids are odd.
    next_stream_id: AtomicU32,
    decoder: StdMutex<MuxFrameDecoder>,
    ready: AtomicBool,
}

/// Forwarder multiplexing many local connections over the data channel.
pub struct MuxPortForwarding {
    parameters: PortParameters,
    state: Arc<MuxState>,
    bound_port: StdMutex<Option<u16>>,
}

impl MuxPortForwarding {
    pub fn new(parameters: PortParameters) -> Self {
        Self {
            parameters,
            state: Arc::new(MuxState {
                data_channel: StdMutex::new(None),
                streams: StdMutex::new(HashMap::new()),
                next_stream_id: AtomicU32::new(1),
                decoder: StdMutex::new(MuxFrameDecoder::default()),
                ready: AtomicBool::new(false),
            }),
            bound_port: StdMutex::new(None),
        }
    }

    /// Port the TCP listener actually bound, once listening.
    pub fn bound_port(&self) -> Option<u16> {
        *self.bound_port.lock().expect("bound port lock")
    }

    fn dispatch_frame(&self, frame: MuxFrame) {
        if frame.version != MUX_VERSION {
            warn!("dropping mux frame with unknown version {}", frame.version);
            return;
        }
        match frame.command {
            CMD_PSH => {
                let sender = self
                    .state
                    .streams
                    .lock()
                    .expect("streams lock")
                    .get(&frame.stream_id)
                    .cloned();
                match sender {
                    Some(sender) => {
                        // A send error means the local writer is gone; the
                        // FIN path cleans the entry up.
                        let _ = sender.send(frame.data);
                    }
                    None => debug!("data for closed stream {}", frame.stream_id),
                }
            }
            CMD_FIN => {
                debug!("agent closed stream {}", frame.stream_id);
                self.state
                    .streams
                    .lock()
                    .expect("streams lock")
                    .remove(&frame.stream_id);
            }
            // The client never receives SYN in local port forwarding;
            // keep-alives carry nothing.
            CMD_SYN | CMD_NOP => {}
            other => warn!("unknown mux command {other}"),
        }
    }
}

#[async_trait]
impl PortForwarder for MuxPortForwarding {
    fn write_stream(&self, payload: &[u8]) -> Result<bool> {
        // Until the listener is up the payload must stay unconsumed so the
        // agent retransmits it.
        if !self.state.ready.load(Ordering::SeqCst) {
            debug!("mux session not established, holding incoming payload");
            return Ok(false);
        }
        let frames: Vec<MuxFrame> = {
            let mut decoder = self.state.decoder.lock().expect("decoder lock");
            decoder.feed(payload);
            std::iter::from_fn(|| decoder.next_frame()).collect()
        };
        for frame in frames {
            self.dispatch_frame(frame);
        }
        Ok(true)
    }

    async fn run(&self, context: &SessionContext) -> Result<()> {
        let data_channel = context.data_channel.clone();
        *self.state.data_channel.lock().expect("data channel lock") = Some(data_channel.clone());
        spawn_terminate_on_interrupt(data_channel.clone(), true);

        let (listener, port) = LocalListener::bind(&self.parameters, &context.session_id).await?;
        *self.bound_port.lock().expect("bound port lock") = port;
        self.state.ready.store(true, Ordering::SeqCst);

        loop {
            let accepted = tokio::select! {
                _ = data_channel.wait_for_session_ended() => return Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((reader, writer)) => {
                    self.open_stream(reader, writer, &data_channel).await?;
                }
                Err(e) => {
                    if data_channel.is_session_ended() {
                        return Ok(());
                    }
                    error!("failed to accept connection: {e}");
                    return Err(e.into());
                }
            }
        }
    }

    fn stop(&self) {
        self.state.streams.lock().expect("streams lock").clear();
        if let Some(channel) = self
            .state
            .data_channel
            .lock()
            .expect("data channel lock")
            .clone()
        {
            channel.end_session();
        }
    }

    /// A reconnected data channel restarts the mux session: in-flight
    /// virtual streams are closed and partial frame state is dropped.
    fn on_reconnect(&self) {
        info!("data channel reconnected, resetting mux session");
        self.state.streams.lock().expect("streams lock").clear();
        self.state.decoder.lock().expect("decoder lock").reset();
    }
}

impl MuxPortForwarding {
    /// Opens a virtual stream for one accepted local connection and spawns
    /// its two pump tasks.
    async fn open_stream(
        &self,
        mut reader: BoxedReader,
        mut writer: BoxedWriter,
        data_channel: &Arc<DataChannel>,
    ) -> Result<()> {
        let stream_id = self.state.next_stream_id.fetch_add(2, Ordering::SeqCst);
        debug!("opening mux stream {stream_id}");

        let (stream_tx, mut stream_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.state
            .streams
            .lock()
            .expect("streams lock")
            .insert(stream_id, stream_tx);

        data_channel
            .send_input_data(PayloadType::Output, &encode_frame(CMD_SYN, stream_id, &[]))
            .await?;

        // Local writer: inbound PSH data to the local peer. Dropping the
        // sender (FIN or reset) ends the task and closes the connection.
        tokio::spawn(async move {
            while let Some(data) = stream_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
        });

        // Local reader: local bytes become PSH frames; EOF becomes FIN.
        let state = self.state.clone();
        let channel = data_channel.clone();
        tokio::spawn(async move {
            let mut buffer = [0u8; config::STREAM_DATA_PAYLOAD_SIZE];
            loop {
                match reader.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = encode_frame(CMD_PSH, stream_id, &buffer[..n]);
                        if let Err(e) = channel.send_input_data(PayloadType::Output, &frame).await
                        {
                            error!("failed to send mux data for stream {stream_id}: {e}");
                            break;
                        }
                    }
                }
            }
            let still_open = state
                .streams
                .lock()
                .expect("streams lock")
                .remove(&stream_id)
                .is_some();
            if still_open && !channel.is_session_ended() {
                debug!("local peer closed mux stream {stream_id}");
                let _ = channel
                    .send_input_data(PayloadType::Output, &encode_frame(CMD_FIN, stream_id, &[]))
                    .await;
            }
        });
        Ok(())
    }
}
