//! WebSocket transport for the data channel.
//!
//! One channel per session. Writes from every task funnel through a mutexed
//! sink so at most one outbound send is in flight; a spawned reader task
//! delivers inbound binary frames and transport failures into a single event
//! queue consumed by the session's dispatcher.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info};

use protocol::error::{ProtocolError, Result};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Events the transport delivers to the inbound dispatcher.
#[derive(Debug)]
pub enum TransportEvent {
    /// A binary frame arrived.
    Message(Vec<u8>),
    /// The connection failed; the session decides whether to reconnect.
    Error(ProtocolError),
}

/// Narrow send-side capability the data channel depends on.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one binary frame.
    async fn send_binary(&self, data: &[u8]) -> Result<()>;
    /// Sends one text frame.
    async fn send_text(&self, data: String) -> Result<()>;
    /// Closes the connection.
    async fn close(&self) -> Result<()>;
}

/// A dialed WebSocket to the managed-session service.
pub struct WebSocketChannel {
    stream_url: String,
    channel_token: StdMutex<String>,
    writer: Mutex<Option<WsSink>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl WebSocketChannel {
    /// Creates an unopened channel. Inbound frames and errors will surface
    /// on `event_tx` once [`WebSocketChannel::open`] is called.
    pub fn new(
        stream_url: impl Into<String>,
        channel_token: impl Into<String>,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            stream_url: stream_url.into(),
            channel_token: StdMutex::new(channel_token.into()),
            writer: Mutex::new(None),
            reader_task: StdMutex::new(None),
            event_tx,
        }
    }

    /// The streaming URL this channel dials.
    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    /// The current channel token.
    pub fn channel_token(&self) -> String {
        self.channel_token.lock().expect("token lock").clone()
    }

    /// Replaces the channel token, e.g. after `ResumeSession`.
    pub fn set_channel_token(&self, token: impl Into<String>) {
        *self.channel_token.lock().expect("token lock") = token.into();
    }

    /// Dials the streaming URL and starts the reader task.
    pub async fn open(&self) -> Result<()> {
        info!("opening websocket connection to {}", self.stream_url);

        let (ws_stream, _response) = connect_async(&self.stream_url)
            .await
            .map_err(|e| ProtocolError::Transport(format!("failed to dial websocket: {e}")))?;
        let (sink, mut stream) = ws_stream.split();
        *self.writer.lock().await = Some(sink);

        let event_tx = self.event_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Binary(data)) => {
                        if event_tx.send(TransportEvent::Message(data)).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        debug!("websocket close frame received");
                        let _ = event_tx.send(TransportEvent::Error(ProtocolError::RemoteClose(
                            "websocket closed by peer".to_string(),
                        )));
                        break;
                    }
                    // Text frames and ping/pong are not part of the binary
                    // message stream.
                    Ok(_) => {}
                    Err(e) => {
                        error!("websocket read failed: {e}");
                        let _ = event_tx
                            .send(TransportEvent::Error(ProtocolError::Transport(e.to_string())));
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self
            .reader_task
            .lock()
            .expect("reader task lock")
            .replace(reader)
        {
            previous.abort();
        }

        info!("successfully opened websocket connection to {}", self.stream_url);
        Ok(())
    }

    /// Tears down the current connection and dials again.
    pub async fn reconnect(&self) -> Result<()> {
        if let Err(e) = self.close().await {
            debug!("closing websocket before reconnect failed: {e}");
        }
        self.open().await.map_err(|e| {
            ProtocolError::Transport(format!(
                "failed to reconnect data channel {}: {e}",
                self.stream_url
            ))
        })?;
        info!("successfully reconnected to data channel {}", self.stream_url);
        Ok(())
    }

    async fn send(&self, message: WsMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink
                .send(message)
                .await
                .map_err(|e| ProtocolError::Transport(format!("websocket send failed: {e}"))),
            None => Err(ProtocolError::Transport(
                "websocket channel is not open".to_string(),
            )),
        }
    }
}

#[async_trait]
impl Transport for WebSocketChannel {
    async fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send(WsMessage::Binary(data.to_vec())).await
    }

    async fn send_text(&self, data: String) -> Result<()> {
        self.send(WsMessage::Text(data)).await
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.reader_task.lock().expect("reader task lock").take() {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        if let Some(mut sink) = writer.take() {
            debug!("closing websocket connection to {}", self.stream_url);
            let _ = sink.send(WsMessage::Close(None)).await;
            sink.close()
                .await
                .map_err(|e| ProtocolError::Transport(format!("websocket close failed: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = WebSocketChannel::new("wss://example.invalid/stream", "token", tx);
        let err = channel.send_binary(b"data").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport(_)));
    }

    #[tokio::test]
    async fn test_close_without_open_is_a_no_op() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = WebSocketChannel::new("wss://example.invalid/stream", "token", tx);
        channel.close().await.unwrap();
    }

    #[test]
    fn test_channel_token_swap() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = WebSocketChannel::new("wss://example.invalid/stream", "initial", tx);
        assert_eq!(channel.channel_token(), "initial");
        channel.set_channel_token("resumed");
        assert_eq!(channel.channel_token(), "resumed");
    }
}
