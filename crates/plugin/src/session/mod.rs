//! Session lifecycle: registry, startup, and the inbound dispatcher.
//!
//! A session owns one data channel. After the channel opens, the handshake
//! (or the legacy first-output fallback) determines the session type, the
//! matching handler is created from the registry, and the handler pumps
//! local input until the session ends.

pub mod mux;
pub mod port;
pub mod shell;

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use protocol::error::{ProtocolError, Result};
use protocol::message::PayloadType;

use crate::config;
use crate::datachannel::{DataChannel, Dispatch};
use crate::sdk::SessionService;
use crate::websocket::{Transport, TransportEvent, WebSocketChannel};

/// Everything a session handler needs from the negotiated session.
#[derive(Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub target_id: String,
    pub data_channel: Arc<DataChannel>,
    /// Opaque properties from the SessionType handshake action.
    pub session_properties: serde_json::Value,
    pub agent_version: String,
}

/// A session-type implementation: shell or port forwarding.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Plugin name this handler serves.
    fn name(&self) -> &'static str;

    /// Registers the session-specific output-stream handler. Called once,
    /// before [`SessionHandler::run`].
    fn initialize(&self, context: &SessionContext) -> Result<()>;

    /// Pumps local input into the data channel until the session ends.
    async fn run(&self, context: &SessionContext) -> Result<()>;

    /// Releases local resources (terminal state, listeners). Invoked when
    /// the service closes the channel or the session aborts.
    fn stop(&self);

    /// Invoked after the transport reconnects; handlers with in-flight
    /// multiplexed streams drop them here.
    fn on_reconnect(&self) {}
}

type HandlerFactory = Box<dyn Fn() -> Arc<dyn SessionHandler> + Send + Sync>;

/// Maps session-type names to handler factories. Built once in `main` and
/// shared by every session.
pub struct SessionRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl SessionRegistry {
    pub fn builder() -> SessionRegistryBuilder {
        SessionRegistryBuilder {
            factories: HashMap::new(),
        }
    }

    /// Instantiates the handler registered under `name`.
    pub fn create(&self, name: &str) -> Option<Arc<dyn SessionHandler>> {
        self.factories.get(name).map(|factory| factory())
    }
}

/// Builder collecting handler registrations.
pub struct SessionRegistryBuilder {
    factories: HashMap<String, HandlerFactory>,
}

impl SessionRegistryBuilder {
    pub fn register(
        mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Arc<dyn SessionHandler> + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn build(self) -> SessionRegistry {
        SessionRegistry {
            factories: self.factories,
        }
    }
}

/// Inputs for building a [`Session`].
pub struct SessionParams {
    pub session_id: String,
    pub stream_url: String,
    pub token_value: String,
    pub target_id: String,
    pub client_id: String,
    pub client_version: String,
    pub registry: Arc<SessionRegistry>,
    pub service: Arc<dyn SessionService>,
    pub data_key_provider: Arc<dyn protocol::encryption::DataKeyProvider>,
}

/// One managed session from `Open` to `EndSession`.
pub struct Session {
    session_id: String,
    target_id: String,
    data_channel: Arc<DataChannel>,
    ws_channel: Arc<WebSocketChannel>,
    registry: Arc<SessionRegistry>,
    service: Arc<dyn SessionService>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    active_handler: Arc<StdMutex<Option<Arc<dyn SessionHandler>>>>,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let ws_channel = Arc::new(WebSocketChannel::new(
            params.stream_url,
            params.token_value,
            event_tx,
        ));
        let data_channel = Arc::new(DataChannel::new(
            params.client_id,
            params.session_id.clone(),
            params.target_id.clone(),
            params.client_version,
            ws_channel.clone() as Arc<dyn Transport>,
            params.data_key_provider,
        ));
        Self {
            session_id: params.session_id,
            target_id: params.target_id,
            data_channel,
            ws_channel,
            registry: params.registry,
            service: params.service,
            event_rx: Mutex::new(Some(event_rx)),
            active_handler: Arc::new(StdMutex::new(None)),
        }
    }

    /// The session's data channel, for tests and diagnostics.
    pub fn data_channel(&self) -> &Arc<DataChannel> {
        &self.data_channel
    }

    /// Opens the data channel and runs the session to completion.
    pub async fn execute(&self) -> Result<()> {
        info!("starting session with session id {}", self.session_id);

        register_first_message_handler(&self.data_channel);
        self.open_data_channel().await?;
        self.spawn_dispatcher();
        self.spawn_resend_timeout_watcher();

        // The session type is set either by handshake or by the first
        // packet received.
        if !self.data_channel.wait_for_session_type().await {
            error!("unable to set session type for session {}", self.session_id);
            return Err(ProtocolError::Handshake(
                "unable to determine session type".to_string(),
            ));
        }

        let session_type = self
            .data_channel
            .session_type()
            .expect("session type present after rendezvous");
        let handler = self.registry.create(&session_type).ok_or_else(|| {
            ProtocolError::Handshake(format!("no handler registered for {session_type}"))
        })?;
        *self.active_handler.lock().expect("handler slot lock") = Some(handler.clone());

        let context = SessionContext {
            session_id: self.session_id.clone(),
            target_id: self.target_id.clone(),
            data_channel: self.data_channel.clone(),
            session_properties: self.data_channel.session_properties(),
            agent_version: self.data_channel.agent_version(),
        };
        handler.initialize(&context)?;
        handler.run(&context).await
    }

    /// Dials the WebSocket and presents the channel token, retrying with
    /// exponential backoff on initial failure. Also starts the resend
    /// scheduler.
    async fn open_data_channel(&self) -> Result<()> {
        let open_result = self.open_channel_once().await;
        if let Err(e) = open_result {
            error!(
                "opening data channel for session {} failed, retrying: {e}",
                self.session_id
            );
            let ws_channel = self.ws_channel.clone();
            let data_channel = self.data_channel.clone();
            with_exponential_retry(
                config::DATA_CHANNEL_NUM_MAX_RETRIES,
                config::DATA_CHANNEL_RETRY_INITIAL_DELAY,
                config::DATA_CHANNEL_RETRY_MAX_INTERVAL,
                config::RETRY_BASE,
                move || {
                    let ws_channel = ws_channel.clone();
                    let data_channel = data_channel.clone();
                    async move {
                        ws_channel.reconnect().await?;
                        data_channel
                            .finalize_data_channel_handshake(&ws_channel.channel_token())
                            .await
                    }
                },
            )
            .await?;
        }

        self.data_channel.start_resend_scheduler();
        Ok(())
    }

    async fn open_channel_once(&self) -> Result<()> {
        self.ws_channel.open().await?;
        self.data_channel
            .finalize_data_channel_handshake(&self.ws_channel.channel_token())
            .await
    }

    /// Spawns the inbound dispatcher: frames go to the data channel in
    /// arrival order, transport errors trigger the resume-session flow.
    fn spawn_dispatcher(&self) {
        let mut event_rx = self
            .event_rx
            .try_lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .expect("dispatcher spawned once");
        let data_channel = self.data_channel.clone();
        let ws_channel = self.ws_channel.clone();
        let service = self.service.clone();
        let active_handler = self.active_handler.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    TransportEvent::Message(raw) => {
                        if data_channel.handle_incoming(&raw).await == Dispatch::ChannelClosed {
                            if let Some(handler) = current_handler(&active_handler) {
                                handler.stop();
                            }
                            break;
                        }
                    }
                    TransportEvent::Error(e) => {
                        if data_channel.is_session_ended() {
                            break;
                        }
                        error!("transport error on session {session_id}: {e}");
                        match resume_session(&session_id, &service, &ws_channel, &data_channel)
                            .await
                        {
                            Ok(true) => {
                                if let Some(handler) = current_handler(&active_handler) {
                                    handler.on_reconnect();
                                }
                            }
                            Ok(false) => {
                                info!("session {session_id} timed out");
                                data_channel.end_session();
                                if let Some(handler) = current_handler(&active_handler) {
                                    handler.stop();
                                }
                                break;
                            }
                            Err(e) => {
                                error!("failed to resume session {session_id}: {e}");
                                data_channel.end_session();
                                if let Some(handler) = current_handler(&active_handler) {
                                    handler.stop();
                                }
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns the watcher that terminates the session when the resend
    /// scheduler gives up on an unacknowledged message.
    fn spawn_resend_timeout_watcher(&self) {
        let data_channel = self.data_channel.clone();
        let service = self.service.clone();
        let active_handler = self.active_handler.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = data_channel.wait_for_resend_timeout() => {
                    error!(
                        "terminating session {session_id}: stream data was not processed before timeout"
                    );
                    if let Err(e) = service.terminate_session(&session_id).await {
                        error!("unable to terminate session upon stream data timeout: {e}");
                    }
                    data_channel.end_session();
                    let _ = data_channel.close().await;
                    if let Some(handler) = current_handler(&active_handler) {
                        handler.stop();
                    }
                }
                _ = data_channel.wait_for_session_ended() => {}
            }
        });
    }
}

fn current_handler(
    slot: &Arc<StdMutex<Option<Arc<dyn SessionHandler>>>>,
) -> Option<Arc<dyn SessionHandler>> {
    slot.lock().expect("handler slot lock").clone()
}

/// Registers the fallback for agents that skip handshake and immediately
/// stream shell output: the first `Output` frame fixes the session type to
/// shell and is written to stdout. The handler removes itself after its
/// first invocation.
pub fn register_first_message_handler(data_channel: &Arc<DataChannel>) {
    let token_cell: Arc<StdMutex<Option<u64>>> = Arc::new(StdMutex::new(None));
    let cell = token_cell.clone();

    let token = data_channel.register_output_stream_handler(
        Arc::new(move |channel, message| {
            // Runs once, for the very first stream data message.
            if let Some(token) = cell.lock().expect("token cell lock").take() {
                channel.deregister_output_stream_handler(token);
            }
            if channel.session_type().is_none()
                && message.payload_type == PayloadType::Output as u32
            {
                info!("setting session type to shell based on the first payload");
                channel.set_session_type(config::SHELL_PLUGIN_NAME);
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(&message.payload);
                let _ = stdout.flush();
            }
            Ok(true)
        }),
        false,
    );
    *token_cell.lock().expect("token cell lock") = Some(token);
}

/// Resumes a dropped session: fetch a fresh token, swap it into the channel,
/// and reconnect with backoff. Returns `false` when the service reports the
/// session as timed out.
async fn resume_session(
    session_id: &str,
    service: &Arc<dyn SessionService>,
    ws_channel: &Arc<WebSocketChannel>,
    data_channel: &Arc<DataChannel>,
) -> Result<bool> {
    let token = service.resume_session(session_id).await?;
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Ok(false);
    };
    ws_channel.set_channel_token(token);

    let ws = ws_channel.clone();
    let dc = data_channel.clone();
    with_exponential_retry(
        config::DATA_CHANNEL_NUM_MAX_RETRIES,
        config::DATA_CHANNEL_RETRY_INITIAL_DELAY,
        config::DATA_CHANNEL_RETRY_MAX_INTERVAL,
        config::RETRY_BASE,
        move || {
            let ws = ws.clone();
            let dc = dc.clone();
            async move {
                ws.reconnect().await?;
                dc.finalize_data_channel_handshake(&ws.channel_token()).await
            }
        },
    )
    .await?;
    Ok(true)
}

/// Runs `operation` until it succeeds or `max_attempts` is reached, sleeping
/// a geometrically growing delay between attempts.
async fn with_exponential_retry<F, Fut>(
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    ratio: f64,
    mut operation: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(e);
                }
                debug!("attempt {attempt} failed, retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * ratio).min(max_delay.as_secs_f64()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datachannel::test_support::{agent_frame, test_channel};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NoopHandler;

    #[async_trait]
    impl SessionHandler for NoopHandler {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn initialize(&self, _context: &SessionContext) -> Result<()> {
            Ok(())
        }
        async fn run(&self, _context: &SessionContext) -> Result<()> {
            Ok(())
        }
        fn stop(&self) {}
    }

    #[test]
    fn test_registry_creates_registered_handlers() {
        let registry = SessionRegistry::builder()
            .register("noop", || Arc::new(NoopHandler) as Arc<dyn SessionHandler>)
            .build();
        assert!(registry.create("noop").is_some());
        assert!(registry.create("missing").is_none());
    }

    #[tokio::test]
    async fn test_first_output_frame_sets_shell_session_type() {
        let (channel, transport) = test_channel();
        register_first_message_handler(&channel);

        let frame = agent_frame(0, PayloadType::Output, b"hello\n");
        channel.handle_incoming(&frame).await;

        assert_eq!(channel.session_type().as_deref(), Some(config::SHELL_PLUGIN_NAME));
        assert!(channel.wait_for_session_type().await);
        assert_eq!(transport.sent_acknowledges().len(), 1);
        assert_eq!(transport.sent_acknowledges()[0].sequence_number, 0);
    }

    #[tokio::test]
    async fn test_first_message_handler_runs_only_once() {
        let (channel, _transport) = test_channel();
        register_first_message_handler(&channel);

        // A non-Output frame consumes the fallback without setting a type.
        let size_frame = agent_frame(0, PayloadType::Size, br#"{"cols":80,"rows":24}"#);
        channel.handle_incoming(&size_frame).await;
        assert!(channel.session_type().is_none());

        // Later Output frames no longer trigger the fallback.
        let output_frame = agent_frame(1, PayloadType::Output, b"late");
        channel.handle_incoming(&output_frame).await;
        assert!(channel.session_type().is_none());
    }

    #[tokio::test]
    async fn test_exponential_retry_stops_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result = with_exponential_retry(
            3,
            Duration::from_millis(1),
            Duration::from_millis(4),
            2.0,
            move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ProtocolError::Transport("still down".to_string()))
                }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exponential_retry_returns_on_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        with_exponential_retry(
            5,
            Duration::from_millis(1),
            Duration::from_millis(4),
            2.0,
            move || {
                let counted = counted.clone();
                async move {
                    if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProtocolError::Transport("flaky".to_string()))
                    } else {
                        Ok(())
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
