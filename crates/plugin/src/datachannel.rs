//! Reliable-delivery engine for the session data channel.
//!
//! Every stream data message carries a per-direction sequence number. Sent
//! messages wait in the outgoing buffer until the agent acknowledges them,
//! with a background scheduler retransmitting the head on an adaptive
//! timeout. Inbound frames are acknowledged, de-duplicated, and delivered to
//! the registered output-stream handlers strictly in sequence order;
//! out-of-order arrivals wait in the incoming buffer as raw bytes.
//!
//! The handshake that selects the session type and optionally sets up
//! envelope encryption rides the same sequence space and is processed inline
//! by this module.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use protocol::encryption::{DataKeyProvider, Encrypter};
use protocol::error::{ProtocolError, Result};
use protocol::message::{
    self, ClientMessage, PayloadType, PayloadTypeFlag, ACKNOWLEDGE_MESSAGE, CHANNEL_CLOSED_MESSAGE,
    INPUT_STREAM_MESSAGE, OUTPUT_STREAM_MESSAGE, PAUSE_PUBLICATION_MESSAGE,
    START_PUBLICATION_MESSAGE,
};
use protocol::payload::{
    AcknowledgeContent, ChannelClosed, EncryptionChallengeRequest, EncryptionChallengeResponse,
    HandshakeCompletePayload, HandshakeRequestPayload, HandshakeResponsePayload,
    KmsEncryptionRequest, KmsEncryptionResponse, OpenDataChannelInput, ProcessedClientAction,
    SessionTypeRequest, ACTION_KMS_ENCRYPTION, ACTION_SESSION_TYPE,
};

use crate::config;
use crate::websocket::Transport;

/// Opaque id identifying a registered output-stream handler.
pub type HandlerToken = u64;

/// Handler invoked for each in-order stream data message. Returns whether it
/// was ready to consume the message; a not-ready message is neither
/// acknowledged nor advanced past, so the agent retransmits it.
pub type OutputStreamHandler =
    Arc<dyn Fn(&DataChannel, &ClientMessage) -> Result<bool> + Send + Sync>;

/// Outcome of dispatching one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep pumping frames.
    Continue,
    /// The service closed the channel; the session should stop.
    ChannelClosed,
}

/// A sent message retained for retransmission until acknowledged.
#[derive(Debug, Clone)]
struct StreamingMessage {
    content: Vec<u8>,
    sequence_number: i64,
    last_sent_time: Instant,
    resend_attempt: u32,
}

/// Smoothed round-trip estimators feeding the retransmission timeout.
#[derive(Debug, Clone)]
struct RetransmissionState {
    /// Smoothed round-trip time, seconds.
    round_trip_time: f64,
    /// Smoothed round-trip deviation, seconds.
    round_trip_time_variation: f64,
    retransmission_timeout: Duration,
}

struct RegisteredHandler {
    token: HandlerToken,
    handler: OutputStreamHandler,
}

/// Delivery tunables. Production uses [`DataChannelConfig::default`]; tests
/// shrink the intervals.
#[derive(Debug, Clone)]
pub struct DataChannelConfig {
    pub outgoing_buffer_capacity: usize,
    pub incoming_buffer_capacity: usize,
    pub default_round_trip_time: Duration,
    pub default_round_trip_time_variation: f64,
    pub default_transmission_timeout: Duration,
    pub max_transmission_timeout: Duration,
    pub clock_granularity: Duration,
    pub resend_sleep_interval: Duration,
    pub resend_max_attempt: u32,
    pub rtt_constant: f64,
    pub rttv_constant: f64,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            outgoing_buffer_capacity: config::OUTGOING_MESSAGE_BUFFER_CAPACITY,
            incoming_buffer_capacity: config::INCOMING_MESSAGE_BUFFER_CAPACITY,
            default_round_trip_time: config::DEFAULT_ROUND_TRIP_TIME,
            default_round_trip_time_variation: config::DEFAULT_ROUND_TRIP_TIME_VARIATION,
            default_transmission_timeout: config::DEFAULT_TRANSMISSION_TIMEOUT,
            max_transmission_timeout: config::MAX_TRANSMISSION_TIMEOUT,
            clock_granularity: config::CLOCK_GRANULARITY,
            resend_sleep_interval: config::RESEND_SLEEP_INTERVAL,
            resend_max_attempt: config::RESEND_MAX_ATTEMPT,
            rtt_constant: config::RTT_CONSTANT,
            rttv_constant: config::RTTV_CONSTANT,
        }
    }
}

/// The sequenced, acknowledged message stream between this client and the
/// session agent.
pub struct DataChannel {
    client_id: String,
    session_id: String,
    target_id: String,
    client_version: String,
    config: DataChannelConfig,
    transport: Arc<dyn Transport>,
    data_key_provider: Arc<dyn DataKeyProvider>,

    /// Next inbound sequence number the dispatcher will deliver.
    expected_sequence_number: StdMutex<i64>,
    /// Next outbound sequence number. The lock is held across the whole
    /// send so frames leave the transport in sequence order.
    stream_data_sequence_number: Mutex<i64>,
    outgoing_buffer: StdMutex<VecDeque<StreamingMessage>>,
    incoming_buffer: StdMutex<HashMap<i64, Vec<u8>>>,
    retransmission: StdMutex<RetransmissionState>,

    encryption: StdMutex<Option<Arc<Encrypter>>>,
    encryption_enabled: AtomicBool,

    session_type: StdMutex<Option<String>>,
    session_properties: StdMutex<serde_json::Value>,
    agent_version: StdMutex<String>,
    is_session_ended: AtomicBool,
    ended_notify: Notify,

    session_type_tx: mpsc::Sender<bool>,
    session_type_rx: Mutex<mpsc::Receiver<bool>>,
    resend_timeout_tx: mpsc::Sender<bool>,
    resend_timeout_rx: Mutex<mpsc::Receiver<bool>>,

    output_handlers: StdMutex<Vec<RegisteredHandler>>,
    session_specific_handler_set: AtomicBool,
    next_handler_token: AtomicU64,
}

impl DataChannel {
    /// Creates a data channel with production tunables.
    pub fn new(
        client_id: impl Into<String>,
        session_id: impl Into<String>,
        target_id: impl Into<String>,
        client_version: impl Into<String>,
        transport: Arc<dyn Transport>,
        data_key_provider: Arc<dyn DataKeyProvider>,
    ) -> Self {
        Self::with_config(
            client_id,
            session_id,
            target_id,
            client_version,
            transport,
            data_key_provider,
            DataChannelConfig::default(),
        )
    }

    /// Creates a data channel with explicit tunables.
    pub fn with_config(
        client_id: impl Into<String>,
        session_id: impl Into<String>,
        target_id: impl Into<String>,
        client_version: impl Into<String>,
        transport: Arc<dyn Transport>,
        data_key_provider: Arc<dyn DataKeyProvider>,
        config: DataChannelConfig,
    ) -> Self {
        debug!(
            "initializing data channel for role {}",
            config::ROLE_PUBLISH_SUBSCRIBE
        );
        let (session_type_tx, session_type_rx) = mpsc::channel(1);
        let (resend_timeout_tx, resend_timeout_rx) = mpsc::channel(1);
        let retransmission = RetransmissionState {
            round_trip_time: config.default_round_trip_time.as_secs_f64(),
            round_trip_time_variation: config.default_round_trip_time_variation,
            retransmission_timeout: config.default_transmission_timeout,
        };
        Self {
            client_id: client_id.into(),
            session_id: session_id.into(),
            target_id: target_id.into(),
            client_version: client_version.into(),
            config,
            transport,
            data_key_provider,
            expected_sequence_number: StdMutex::new(0),
            stream_data_sequence_number: Mutex::new(0),
            outgoing_buffer: StdMutex::new(VecDeque::new()),
            incoming_buffer: StdMutex::new(HashMap::new()),
            retransmission: StdMutex::new(retransmission),
            encryption: StdMutex::new(None),
            encryption_enabled: AtomicBool::new(false),
            session_type: StdMutex::new(None),
            session_properties: StdMutex::new(serde_json::Value::Null),
            agent_version: StdMutex::new(String::new()),
            is_session_ended: AtomicBool::new(false),
            ended_notify: Notify::new(),
            session_type_tx,
            session_type_rx: Mutex::new(session_type_rx),
            resend_timeout_tx,
            resend_timeout_rx: Mutex::new(resend_timeout_rx),
            output_handlers: StdMutex::new(Vec::new()),
            session_specific_handler_set: AtomicBool::new(false),
            next_handler_token: AtomicU64::new(1),
        }
    }

    /// Session id this channel belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Session type negotiated by handshake or the legacy fallback.
    pub fn session_type(&self) -> Option<String> {
        self.session_type.lock().expect("session type lock").clone()
    }

    /// Session properties from the handshake, opaque JSON.
    pub fn session_properties(&self) -> serde_json::Value {
        self.session_properties
            .lock()
            .expect("session properties lock")
            .clone()
    }

    /// Agent version recorded during handshake.
    pub fn agent_version(&self) -> String {
        self.agent_version.lock().expect("agent version lock").clone()
    }

    /// Whether the session has been ended locally or by the service.
    pub fn is_session_ended(&self) -> bool {
        self.is_session_ended.load(Ordering::SeqCst)
    }

    /// Marks the session as ended; loops observing the flag wind down.
    pub fn end_session(&self) {
        self.is_session_ended.store(true, Ordering::SeqCst);
        self.ended_notify.notify_waiters();
    }

    /// Resolves once the session has ended.
    pub async fn wait_for_session_ended(&self) {
        loop {
            // The permit must exist before the flag check or a concurrent
            // end_session could slip between them.
            let notified = self.ended_notify.notified();
            if self.is_session_ended() {
                return;
            }
            notified.await;
        }
    }

    /// Number of sent messages awaiting acknowledgement.
    pub fn outgoing_buffer_len(&self) -> usize {
        self.outgoing_buffer.lock().expect("outgoing lock").len()
    }

    /// Next inbound sequence number the channel will deliver.
    pub fn expected_sequence_number(&self) -> i64 {
        *self.expected_sequence_number.lock().expect("expected seq lock")
    }

    /// Whether envelope encryption was negotiated.
    pub fn encryption_enabled(&self) -> bool {
        self.encryption_enabled.load(Ordering::SeqCst)
    }

    /// Closes the underlying transport.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    /// Sets the session type directly, bypassing handshake. Used by the
    /// legacy first-output fallback.
    pub fn set_session_type(&self, session_type: &str) {
        *self.session_type.lock().expect("session type lock") = Some(session_type.to_string());
        let _ = self.session_type_tx.try_send(true);
    }

    /// Resolves once the session type is known. `false` means the handshake
    /// finished without one and the session cannot start.
    pub async fn wait_for_session_type(&self) -> bool {
        self.session_type_rx
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(false)
    }

    /// Resolves when the resend scheduler has given up on the head message.
    pub async fn wait_for_resend_timeout(&self) {
        let _ = self.resend_timeout_rx.lock().await.recv().await;
    }

    /// Registers a handler for inbound stream data. Returns a token for
    /// later deregistration.
    pub fn register_output_stream_handler(
        &self,
        handler: OutputStreamHandler,
        is_session_specific: bool,
    ) -> HandlerToken {
        let token = self.next_handler_token.fetch_add(1, Ordering::SeqCst);
        if is_session_specific {
            self.session_specific_handler_set.store(true, Ordering::SeqCst);
        }
        self.output_handlers
            .lock()
            .expect("handlers lock")
            .push(RegisteredHandler { token, handler });
        token
    }

    /// Removes a previously registered handler.
    pub fn deregister_output_stream_handler(&self, token: HandlerToken) {
        self.output_handlers
            .lock()
            .expect("handlers lock")
            .retain(|registered| registered.token != token);
    }

    /// Presents the channel token to the service. The first and only text
    /// frame on a freshly dialed connection.
    pub async fn finalize_data_channel_handshake(&self, token_value: &str) -> Result<()> {
        info!("sending token through data channel to acknowledge connection");
        let input = OpenDataChannelInput {
            message_schema_version: config::MESSAGE_SCHEMA_VERSION.to_string(),
            request_id: Uuid::new_v4().to_string(),
            token_value: token_value.to_string(),
            client_id: self.client_id.clone(),
            client_version: self.client_version.clone(),
        };
        self.transport.send_text(serde_json::to_string(&input)?).await
    }

    /// Sends a control flag to the agent as a 4-byte big-endian body.
    pub async fn send_flag(&self, flag: PayloadTypeFlag) -> Result<()> {
        self.send_input_data(PayloadType::Flag, &flag.to_be_bytes()).await
    }

    /// Sends one stream data message: sequence it, encrypt if negotiated,
    /// serialize, transmit, and retain for retransmission.
    pub async fn send_input_data(&self, payload_type: PayloadType, input: &[u8]) -> Result<()> {
        let mut sequence_guard = self.stream_data_sequence_number.lock().await;
        let sequence_number = *sequence_guard;

        let mut payload = input.to_vec();
        // winpty treats LF as "next line"; a lone newline must travel as CR.
        if payload == [0x0a] {
            payload = vec![0x0d];
        }

        if self.encryption_enabled() && payload_type == PayloadType::Output {
            let encrypter = self.current_encrypter().ok_or_else(|| {
                ProtocolError::Crypto("encryption enabled without a data key".to_string())
            })?;
            payload = encrypter.encrypt(&payload)?;
        }

        let client_message = ClientMessage {
            message_type: INPUT_STREAM_MESSAGE.to_string(),
            schema_version: 1,
            created_date: message::now_millis(),
            flags: 0,
            message_id: Uuid::new_v4(),
            payload_type: payload_type as u32,
            payload,
            sequence_number,
            ..Default::default()
        };
        let wire = client_message.serialize()?;

        trace!("sending message with sequence number {sequence_number}");
        self.transport.send_binary(&wire).await?;

        self.add_to_outgoing_buffer(StreamingMessage {
            content: wire,
            sequence_number,
            last_sent_time: Instant::now(),
            resend_attempt: 0,
        });
        *sequence_guard += 1;
        Ok(())
    }

    /// Spawns the background task that retransmits the unacknowledged head
    /// of the outgoing buffer. When the resend cap is hit the task signals
    /// the timeout rendezvous and stops.
    pub fn start_resend_scheduler(self: &Arc<Self>) {
        enum ResendAction {
            Idle,
            Resend(Vec<u8>),
            GiveUp(i64, u32),
        }

        let channel = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(channel.config.resend_sleep_interval).await;
                if channel.is_session_ended() {
                    break;
                }

                let retransmission_timeout = channel
                    .retransmission
                    .lock()
                    .expect("retransmission lock")
                    .retransmission_timeout;

                let action = {
                    let mut outgoing = channel.outgoing_buffer.lock().expect("outgoing lock");
                    match outgoing.front_mut() {
                        Some(head) if head.last_sent_time.elapsed() > retransmission_timeout => {
                            if head.resend_attempt >= channel.config.resend_max_attempt {
                                ResendAction::GiveUp(head.sequence_number, head.resend_attempt)
                            } else {
                                head.resend_attempt += 1;
                                head.last_sent_time = Instant::now();
                                debug!(
                                    "resend stream data message {} for the {} attempt",
                                    head.sequence_number, head.resend_attempt
                                );
                                ResendAction::Resend(head.content.clone())
                            }
                        }
                        _ => ResendAction::Idle,
                    }
                };

                match action {
                    ResendAction::Idle => {}
                    ResendAction::Resend(content) => {
                        if let Err(e) = channel.transport.send_binary(&content).await {
                            error!("unable to send stream data message: {e}");
                        }
                    }
                    ResendAction::GiveUp(sequence_number, attempts) => {
                        warn!("message {sequence_number} was resent over {attempts} times");
                        let _ = channel.resend_timeout_tx.try_send(true);
                        break;
                    }
                }
            }
        });
    }

    /// Dispatches one raw inbound frame. Malformed frames are logged and
    /// dropped without touching the sequence state.
    pub async fn handle_incoming(&self, raw: &[u8]) -> Dispatch {
        let client_message = match ClientMessage::deserialize(raw) {
            Ok(message) => message,
            Err(e) => {
                error!("cannot deserialize raw message: {e}");
                return Dispatch::Continue;
            }
        };
        if let Err(e) = client_message.validate() {
            error!("invalid inbound message: {e}");
            return Dispatch::Continue;
        }

        trace!(
            "processing stream data message of type {}",
            client_message.message_type
        );
        let message_type = client_message.message_type.clone();
        match message_type.as_str() {
            OUTPUT_STREAM_MESSAGE => {
                if let Err(e) = self.handle_output_message(client_message, raw).await {
                    error!("failed to process stream data message: {e}");
                }
                Dispatch::Continue
            }
            ACKNOWLEDGE_MESSAGE => {
                if let Err(e) = self.handle_acknowledge_message(&client_message) {
                    error!("failed to process acknowledge message: {e}");
                }
                Dispatch::Continue
            }
            CHANNEL_CLOSED_MESSAGE => {
                self.handle_channel_closed_message(&client_message).await;
                Dispatch::ChannelClosed
            }
            START_PUBLICATION_MESSAGE | PAUSE_PUBLICATION_MESSAGE => Dispatch::Continue,
            other => {
                warn!("invalid message type received: {other}");
                Dispatch::Continue
            }
        }
    }

    async fn handle_output_message(
        &self,
        mut client_message: ClientMessage,
        raw: &[u8],
    ) -> Result<()> {
        let expected = self.expected_sequence_number();

        if client_message.sequence_number == expected {
            match PayloadType::from_u32(client_message.payload_type) {
                Some(PayloadType::HandshakeRequest) => {
                    self.send_acknowledge(&client_message).await?;
                    debug!("processing handshake request");
                    self.handle_handshake_request(&client_message).await?;
                }
                Some(PayloadType::HandshakeComplete) => {
                    self.send_acknowledge(&client_message).await?;
                    self.handle_handshake_complete(&client_message)?;
                }
                Some(PayloadType::EncChallengeRequest) => {
                    self.send_acknowledge(&client_message).await?;
                    self.handle_encryption_challenge(&client_message).await?;
                }
                _ => {
                    trace!(
                        "processing new incoming stream data message, sequence number {}",
                        client_message.sequence_number
                    );
                    self.decrypt_if_eligible(&mut client_message)?;
                    let is_handler_ready =
                        self.process_output_message_with_handlers(&client_message)?;
                    if !is_handler_ready {
                        warn!(
                            "stream data message {} not processed, session handler not ready",
                            client_message.sequence_number
                        );
                        return Ok(());
                    }
                    self.send_acknowledge(&client_message).await?;
                }
            }
            {
                let mut guard = self
                    .expected_sequence_number
                    .lock()
                    .expect("expected seq lock");
                *guard += 1;
            }
            self.process_incoming_buffer_items().await
        } else if client_message.sequence_number > expected {
            debug!(
                "sequence number {} is ahead of expected {}, buffering",
                client_message.sequence_number, expected
            );
            let has_room = self.incoming_buffer.lock().expect("incoming lock").len()
                < self.config.incoming_buffer_capacity;
            if has_room {
                self.send_acknowledge(&client_message).await?;
                self.incoming_buffer
                    .lock()
                    .expect("incoming lock")
                    .insert(client_message.sequence_number, raw.to_vec());
            }
            Ok(())
        } else {
            // A duplicate means our previous acknowledgement was lost;
            // acknowledge again without reprocessing.
            debug!(
                "duplicate sequence number {} below expected {}",
                client_message.sequence_number, expected
            );
            self.send_acknowledge(&client_message).await
        }
    }

    /// Drains the contiguous prefix now available in the incoming buffer.
    /// Buffered frames were acknowledged on arrival.
    async fn process_incoming_buffer_items(&self) -> Result<()> {
        loop {
            let expected = self.expected_sequence_number();
            let raw = self
                .incoming_buffer
                .lock()
                .expect("incoming lock")
                .remove(&expected);
            let Some(raw) = raw else { break };

            debug!("processing buffered stream data message, sequence number {expected}");
            let mut client_message = ClientMessage::deserialize(&raw)?;
            self.decrypt_if_eligible(&mut client_message)?;
            if let Err(e) = self.process_output_message_with_handlers(&client_message) {
                error!("failed to process buffered stream data message: {e}");
            }

            let mut guard = self
                .expected_sequence_number
                .lock()
                .expect("expected seq lock");
            *guard += 1;
        }
        Ok(())
    }

    fn handle_acknowledge_message(&self, client_message: &ClientMessage) -> Result<()> {
        let acknowledge: AcknowledgeContent = serde_json::from_slice(&client_message.payload)?;
        self.process_acknowledged_message(&acknowledge);
        Ok(())
    }

    /// Removes the acknowledged message from the outgoing buffer and feeds
    /// its round trip into the RTO estimators.
    pub fn process_acknowledged_message(&self, acknowledge: &AcknowledgeContent) {
        let sample = {
            let mut outgoing = self.outgoing_buffer.lock().expect("outgoing lock");
            let index = outgoing
                .iter()
                .position(|m| m.sequence_number == acknowledge.sequence_number);
            index
                .and_then(|index| outgoing.remove(index))
                .map(|m| m.last_sent_time.elapsed())
        };
        if let Some(round_trip) = sample {
            self.calculate_retransmission_timeout(round_trip);
        }
    }

    async fn handle_channel_closed_message(&self, client_message: &ClientMessage) {
        let channel_closed: ChannelClosed =
            serde_json::from_slice(&client_message.payload).unwrap_or_default();
        if channel_closed.output.is_empty() {
            info!("exiting session with session id {}", self.session_id);
        } else {
            info!("session {}: {}", self.session_id, channel_closed.output);
        }
        self.end_session();
        if let Err(e) = self.transport.close().await {
            debug!("closing transport after channel_closed failed: {e}");
        }
    }

    /// Acknowledges one accepted stream data frame.
    async fn send_acknowledge(&self, client_message: &ClientMessage) -> Result<()> {
        let content = AcknowledgeContent {
            message_type: client_message.message_type.clone(),
            message_id: client_message.message_id.to_string(),
            sequence_number: client_message.sequence_number,
            is_sequential_message: true,
        };
        let wire = ClientMessage::serialize_acknowledge(&content)?;
        self.transport.send_binary(&wire).await
    }

    fn process_output_message_with_handlers(
        &self,
        client_message: &ClientMessage,
    ) -> Result<bool> {
        // Once the session type is known, data is held until the session
        // handler registers itself.
        if self.session_type().is_some()
            && !self.session_specific_handler_set.load(Ordering::SeqCst)
        {
            return Ok(false);
        }

        let handlers: Vec<OutputStreamHandler> = self
            .output_handlers
            .lock()
            .expect("handlers lock")
            .iter()
            .map(|registered| Arc::clone(&registered.handler))
            .collect();

        let mut is_handler_ready = false;
        for handler in handlers {
            is_handler_ready = handler(self, client_message)?;
            if !is_handler_ready {
                break;
            }
        }
        Ok(is_handler_ready)
    }

    fn decrypt_if_eligible(&self, client_message: &mut ClientMessage) -> Result<()> {
        let eligible = matches!(
            PayloadType::from_u32(client_message.payload_type),
            Some(PayloadType::Output | PayloadType::StdErr | PayloadType::ExitCode)
        );
        if self.encryption_enabled() && eligible {
            let encrypter = self.current_encrypter().ok_or_else(|| {
                ProtocolError::Crypto("encryption enabled without a data key".to_string())
            })?;
            client_message.payload = encrypter.decrypt(&client_message.payload)?;
        }
        Ok(())
    }

    fn current_encrypter(&self) -> Option<Arc<Encrypter>> {
        self.encryption.lock().expect("encryption lock").clone()
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    async fn handle_handshake_request(&self, client_message: &ClientMessage) -> Result<()> {
        let request: HandshakeRequestPayload = serde_json::from_slice(&client_message.payload)?;
        *self.agent_version.lock().expect("agent version lock") = request.agent_version.clone();

        let mut errors: Vec<String> = Vec::new();
        let mut processed_actions: Vec<ProcessedClientAction> = Vec::new();

        for action in &request.requested_client_actions {
            let processed = match action.action_type.as_str() {
                ACTION_KMS_ENCRYPTION => {
                    match self.process_kms_encryption_action(&action.action_parameters).await {
                        Ok(result) => ProcessedClientAction {
                            action_type: action.action_type.clone(),
                            action_status: protocol::payload::ActionStatus::Success,
                            action_result: Some(serde_json::to_value(&result)?),
                            error: None,
                        },
                        Err(e) => {
                            let text =
                                format!("Failed to process action {ACTION_KMS_ENCRYPTION}: {e}");
                            errors.push(text.clone());
                            ProcessedClientAction {
                                action_type: action.action_type.clone(),
                                action_status: protocol::payload::ActionStatus::Failed,
                                action_result: None,
                                error: Some(text),
                            }
                        }
                    }
                }
                ACTION_SESSION_TYPE => {
                    match self.process_session_type_action(&action.action_parameters) {
                        Ok(()) => ProcessedClientAction {
                            action_type: action.action_type.clone(),
                            action_status: protocol::payload::ActionStatus::Success,
                            action_result: None,
                            error: None,
                        },
                        Err(e) => {
                            let text =
                                format!("Failed to process action {ACTION_SESSION_TYPE}: {e}");
                            errors.push(text.clone());
                            ProcessedClientAction {
                                action_type: action.action_type.clone(),
                                action_status: protocol::payload::ActionStatus::Failed,
                                action_result: None,
                                error: Some(text),
                            }
                        }
                    }
                }
                other => {
                    let text = format!("Unsupported action {other}");
                    errors.push(text.clone());
                    ProcessedClientAction {
                        action_type: other.to_string(),
                        action_status: protocol::payload::ActionStatus::Unsupported,
                        action_result: None,
                        error: Some(text),
                    }
                }
            };
            processed_actions.push(processed);
        }

        let response = HandshakeResponsePayload {
            client_version: self.client_version.clone(),
            processed_client_actions: processed_actions,
            errors,
        };
        trace!("sending handshake response");
        self.send_input_data(
            PayloadType::HandshakeResponse,
            &serde_json::to_vec(&response)?,
        )
        .await
    }

    async fn process_kms_encryption_action(
        &self,
        action_parameters: &serde_json::Value,
    ) -> Result<KmsEncryptionResponse> {
        let request: KmsEncryptionRequest =
            serde_json::from_value(action_parameters.clone())?;
        let encrypter = Encrypter::new(
            self.data_key_provider.as_ref(),
            &request.kms_key_id,
            &self.session_id,
            &self.target_id,
        )
        .await?;
        let response = KmsEncryptionResponse {
            kms_cipher_text_key: encrypter.encrypted_data_key().to_vec(),
        };
        *self.encryption.lock().expect("encryption lock") = Some(Arc::new(encrypter));
        self.encryption_enabled.store(true, Ordering::SeqCst);
        Ok(response)
    }

    fn process_session_type_action(&self, action_parameters: &serde_json::Value) -> Result<()> {
        let request: SessionTypeRequest = serde_json::from_value(action_parameters.clone())?;
        let resolved = match request.session_type.as_str() {
            // Interactive and non-interactive command sessions run through
            // the shell handler.
            config::SHELL_PLUGIN_NAME
            | config::INTERACTIVE_COMMANDS_PLUGIN_NAME
            | config::NON_INTERACTIVE_COMMANDS_PLUGIN_NAME => config::SHELL_PLUGIN_NAME,
            config::PORT_PLUGIN_NAME => config::PORT_PLUGIN_NAME,
            other => {
                return Err(ProtocolError::Handshake(format!(
                    "unknown session type {other}"
                )))
            }
        };
        *self.session_type.lock().expect("session type lock") = Some(resolved.to_string());
        *self.session_properties.lock().expect("session properties lock") = request.properties;
        Ok(())
    }

    fn handle_handshake_complete(&self, client_message: &ClientMessage) -> Result<()> {
        let complete: HandshakeCompletePayload = serde_json::from_slice(&client_message.payload)?;

        let type_was_set = self.session_type().is_some();
        let _ = self.session_type_tx.try_send(type_was_set);

        debug!(
            "handshake complete, time to complete: {:.3} seconds",
            complete.handshake_time_to_complete_ns as f64 / 1e9
        );
        if !complete.customer_message.is_empty() {
            debug!("{}", complete.customer_message);
        }
        Ok(())
    }

    /// Answers the agent's encryption challenge: decrypt with the agent key
    /// half, re-encrypt with the client key half, and send it back. Proves
    /// both sides hold the same data key.
    async fn handle_encryption_challenge(&self, client_message: &ClientMessage) -> Result<()> {
        let request: EncryptionChallengeRequest =
            serde_json::from_slice(&client_message.payload)?;
        let encrypter = self.current_encrypter().ok_or_else(|| {
            ProtocolError::Handshake(
                "encryption challenge received before encryption was set up".to_string(),
            )
        })?;
        let decrypted = encrypter.decrypt(&request.challenge)?;
        let challenge = encrypter.encrypt(&decrypted)?;
        let response = EncryptionChallengeResponse { challenge };
        trace!("sending encryption challenge response");
        self.send_input_data(
            PayloadType::EncChallengeResponse,
            &serde_json::to_vec(&response)?,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Buffers and timers
    // ------------------------------------------------------------------

    fn add_to_outgoing_buffer(&self, streaming_message: StreamingMessage) {
        let mut outgoing = self.outgoing_buffer.lock().expect("outgoing lock");
        if outgoing.len() == self.config.outgoing_buffer_capacity {
            outgoing.pop_front();
        }
        outgoing.push_back(streaming_message);
    }

    /// Jacobson/Karels update of the smoothed RTT estimators and the
    /// retransmission timeout, clamped to the configured maximum.
    fn calculate_retransmission_timeout(&self, round_trip: Duration) {
        let mut state = self.retransmission.lock().expect("retransmission lock");
        let new_round_trip_time = round_trip.as_secs_f64();

        state.round_trip_time_variation = (1.0 - self.config.rttv_constant)
            * state.round_trip_time_variation
            + self.config.rttv_constant * (state.round_trip_time - new_round_trip_time).abs();

        state.round_trip_time = (1.0 - self.config.rtt_constant) * state.round_trip_time
            + self.config.rtt_constant * new_round_trip_time;

        let timeout = state.round_trip_time
            + self
                .config
                .clock_granularity
                .as_secs_f64()
                .max(4.0 * state.round_trip_time_variation);

        state.retransmission_timeout =
            Duration::from_secs_f64(timeout).min(self.config.max_transmission_timeout);
    }

    #[cfg(test)]
    fn retransmission_timeout(&self) -> Duration {
        self.retransmission
            .lock()
            .expect("retransmission lock")
            .retransmission_timeout
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use protocol::encryption::{GeneratedDataKey, KMS_KEY_SIZE_IN_BYTES};
    use std::collections::HashMap as StdHashMap;

    /// Transport that records everything sent through it.
    #[derive(Default)]
    pub struct MockTransport {
        pub binary: StdMutex<Vec<Vec<u8>>>,
        pub text: StdMutex<Vec<String>>,
        pub closed: AtomicBool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_binary(&self, data: &[u8]) -> Result<()> {
            self.binary.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        async fn send_text(&self, data: String) -> Result<()> {
            self.text.lock().unwrap().push(data);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    impl MockTransport {
        /// Everything sent, parsed back into client messages.
        pub fn sent_messages(&self) -> Vec<ClientMessage> {
            self.binary
                .lock()
                .unwrap()
                .iter()
                .map(|raw| ClientMessage::deserialize(raw).expect("sent frame parses"))
                .collect()
        }

        /// Acknowledge payloads sent, in order.
        pub fn sent_acknowledges(&self) -> Vec<AcknowledgeContent> {
            self.sent_messages()
                .iter()
                .filter(|m| m.message_type == ACKNOWLEDGE_MESSAGE)
                .map(|m| serde_json::from_slice(&m.payload).expect("ack payload parses"))
                .collect()
        }
    }

    /// Data-key provider handing out fixed material.
    pub struct StaticKeyProvider;

    pub fn static_key_material() -> [u8; KMS_KEY_SIZE_IN_BYTES] {
        let mut material = [0u8; KMS_KEY_SIZE_IN_BYTES];
        for (i, byte) in material.iter_mut().enumerate() {
            *byte = (i * 3) as u8;
        }
        material
    }

    #[async_trait]
    impl DataKeyProvider for StaticKeyProvider {
        async fn generate_data_key(
            &self,
            _kms_key_id: &str,
            _encryption_context: &StdHashMap<String, String>,
        ) -> Result<GeneratedDataKey> {
            Ok(GeneratedDataKey {
                ciphertext_blob: b"wrapped".to_vec(),
                plaintext: static_key_material().to_vec(),
            })
        }
    }

    /// Builds the agent's view of the static key (halves swapped).
    pub fn agent_encrypter() -> Encrypter {
        let material = static_key_material();
        let mut swapped = [0u8; KMS_KEY_SIZE_IN_BYTES];
        swapped[..32].copy_from_slice(&material[32..]);
        swapped[32..].copy_from_slice(&material[..32]);
        Encrypter::from_data_key(GeneratedDataKey {
            ciphertext_blob: Vec::new(),
            plaintext: swapped.to_vec(),
        })
        .unwrap()
    }

    /// Serializes an agent-side output frame.
    pub fn agent_frame(sequence_number: i64, payload_type: PayloadType, payload: &[u8]) -> Vec<u8> {
        ClientMessage {
            message_type: OUTPUT_STREAM_MESSAGE.to_string(),
            schema_version: 1,
            created_date: message::now_millis(),
            flags: 0,
            message_id: Uuid::new_v4(),
            payload_type: payload_type as u32,
            payload: payload.to_vec(),
            sequence_number,
            ..Default::default()
        }
        .serialize()
        .unwrap()
    }

    pub fn test_channel() -> (Arc<DataChannel>, Arc<MockTransport>) {
        test_channel_with_config(DataChannelConfig::default())
    }

    pub fn test_channel_with_config(
        config: DataChannelConfig,
    ) -> (Arc<DataChannel>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let channel = Arc::new(DataChannel::with_config(
            "client-1",
            "sess-1",
            "i-123",
            "1.2.0",
            transport.clone() as Arc<dyn Transport>,
            Arc::new(StaticKeyProvider),
            config,
        ));
        (channel, transport)
    }

    /// Registers a handler that records delivered sequence numbers.
    pub fn recording_handler(
        channel: &DataChannel,
        is_session_specific: bool,
    ) -> Arc<StdMutex<Vec<(i64, Vec<u8>)>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        channel.register_output_stream_handler(
            Arc::new(move |_channel, message| {
                seen_clone
                    .lock()
                    .unwrap()
                    .push((message.sequence_number, message.payload.clone()));
                Ok(true)
            }),
            is_session_specific,
        );
        seen
    }
}
