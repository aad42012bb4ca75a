//! End-to-end data-channel flows driven through a recording transport:
//! the legacy shell fallback, the full handshake with envelope encryption,
//! out-of-order arrival, the retransmission cap, and remote channel close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use plugin::config;
use plugin::datachannel::{DataChannel, DataChannelConfig, Dispatch};
use plugin::session::register_first_message_handler;
use plugin::websocket::Transport;
use protocol::encryption::{DataKeyProvider, Encrypter, GeneratedDataKey, KMS_KEY_SIZE_IN_BYTES};
use protocol::error::Result;
use protocol::message::{self, ClientMessage, PayloadType, ACKNOWLEDGE_MESSAGE, CHANNEL_CLOSED_MESSAGE, OUTPUT_STREAM_MESSAGE};
use protocol::payload::{AcknowledgeContent, HandshakeResponsePayload, KmsEncryptionResponse};

/// Transport recording every frame the client sends.
#[derive(Default)]
struct RecordingTransport {
    binary: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.binary.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn send_text(&self, _data: String) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl RecordingTransport {
    fn sent_messages(&self) -> Vec<ClientMessage> {
        self.binary
            .lock()
            .unwrap()
            .iter()
            .map(|raw| ClientMessage::deserialize(raw).expect("sent frame parses"))
            .collect()
    }

    fn acknowledges(&self) -> Vec<AcknowledgeContent> {
        self.sent_messages()
            .iter()
            .filter(|m| m.message_type == ACKNOWLEDGE_MESSAGE)
            .map(|m| serde_json::from_slice(&m.payload).expect("ack payload parses"))
            .collect()
    }
}

struct StaticKeyProvider;

fn key_material() -> [u8; KMS_KEY_SIZE_IN_BYTES] {
    let mut material = [0u8; KMS_KEY_SIZE_IN_BYTES];
    for (i, byte) in material.iter_mut().enumerate() {
        *byte = (i * 7) as u8;
    }
    material
}

#[async_trait]
impl DataKeyProvider for StaticKeyProvider {
    async fn generate_data_key(
        &self,
        _kms_key_id: &str,
        _encryption_context: &HashMap<String, String>,
    ) -> Result<GeneratedDataKey> {
        Ok(GeneratedDataKey {
            ciphertext_blob: b"wrapped-data-key".to_vec(),
            plaintext: key_material().to_vec(),
        })
    }
}

/// The agent's view of the static data key: halves swapped.
fn agent_encrypter() -> Encrypter {
    let material = key_material();
    let mut swapped = [0u8; KMS_KEY_SIZE_IN_BYTES];
    swapped[..32].copy_from_slice(&material[32..]);
    swapped[32..].copy_from_slice(&material[..32]);
    Encrypter::from_data_key(GeneratedDataKey {
        ciphertext_blob: Vec::new(),
        plaintext: swapped.to_vec(),
    })
    .unwrap()
}

fn channel_with_config(config: DataChannelConfig) -> (Arc<DataChannel>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
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

fn channel() -> (Arc<DataChannel>, Arc<RecordingTransport>) {
    channel_with_config(DataChannelConfig::default())
}

fn agent_frame(sequence_number: i64, payload_type: PayloadType, payload: &[u8]) -> Vec<u8> {
    ClientMessage {
        message_type: OUTPUT_STREAM_MESSAGE.to_string(),
        schema_version: 1,
        created_date: message::now_millis(),
        message_id: Uuid::new_v4(),
        payload_type: payload_type as u32,
        payload: payload.to_vec(),
        sequence_number,
        ..Default::default()
    }
    .serialize()
    .unwrap()
}

fn record_deliveries(channel: &Arc<DataChannel>) -> Arc<Mutex<Vec<(i64, Vec<u8>)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    channel.register_output_stream_handler(
        Arc::new(move |_channel, message| {
            sink.lock()
                .unwrap()
                .push((message.sequence_number, message.payload.clone()));
            Ok(true)
        }),
        true,
    );
    seen
}

// S1: a legacy agent skips handshake and streams shell output immediately.
#[tokio::test]
async fn legacy_agent_first_output_selects_shell() {
    let (channel, transport) = channel();
    register_first_message_handler(&channel);

    let frame = agent_frame(0, PayloadType::Output, b"hello\n");
    assert_eq!(channel.handle_incoming(&frame).await, Dispatch::Continue);

    assert!(channel.wait_for_session_type().await);
    assert_eq!(
        channel.session_type().as_deref(),
        Some(config::SHELL_PLUGIN_NAME)
    );
    let acknowledges = transport.acknowledges();
    assert_eq!(acknowledges.len(), 1);
    assert_eq!(acknowledges[0].sequence_number, 0);
    assert_eq!(acknowledges[0].message_type, OUTPUT_STREAM_MESSAGE);
}

// S2: handshake with KMS encryption and session type, then an encrypted
// echo that the client must decrypt.
#[tokio::test]
async fn handshake_then_encrypted_echo() {
    let (channel, transport) = channel();

    let handshake = serde_json::json!({
        "AgentVersion": "3.1.1732.0",
        "RequestedClientActions": [
            {"ActionType": "KMSEncryption", "ActionParameters": {"KMSKeyId": "k"}},
            {"ActionType": "SessionType",
             "ActionParameters": {"SessionType": "Standard_Stream", "Properties": null}}
        ]
    });
    let request_frame = agent_frame(
        0,
        PayloadType::HandshakeRequest,
        &serde_json::to_vec(&handshake).unwrap(),
    );
    channel.handle_incoming(&request_frame).await;

    // The response reports both actions successful and carries the wrapped
    // data key for the agent to unwrap.
    let response_frame = transport
        .sent_messages()
        .into_iter()
        .find(|m| m.payload_type == PayloadType::HandshakeResponse as u32)
        .expect("handshake response sent");
    let response: HandshakeResponsePayload =
        serde_json::from_slice(&response_frame.payload).unwrap();
    assert!(response.errors.is_empty());
    assert_eq!(response.processed_client_actions.len(), 2);
    let kms: KmsEncryptionResponse = serde_json::from_value(
        response.processed_client_actions[0]
            .action_result
            .clone()
            .expect("wrapped key attached"),
    )
    .unwrap();
    assert_eq!(kms.kms_cipher_text_key, b"wrapped-data-key");

    let seen = record_deliveries(&channel);
    let ciphertext = agent_encrypter().encrypt(b"ok").unwrap();
    let echo_frame = agent_frame(1, PayloadType::Output, &ciphertext);
    channel.handle_incoming(&echo_frame).await;

    let delivered = seen.lock().unwrap().clone();
    assert_eq!(delivered, vec![(1, b"ok".to_vec())]);
    assert!(transport
        .acknowledges()
        .iter()
        .any(|a| a.sequence_number == 1));

    let complete = agent_frame(2, PayloadType::HandshakeComplete, b"{}");
    channel.handle_incoming(&complete).await;
    assert!(channel.wait_for_session_type().await);
}

// S3: frames arriving out of order are delivered in order, each exactly
// once, and every arrival is acknowledged.
#[tokio::test]
async fn reordered_frames_deliver_in_sequence() {
    let (channel, transport) = channel();
    let seen = record_deliveries(&channel);

    for sequence in [2i64, 0, 1] {
        let frame = agent_frame(
            sequence,
            PayloadType::Output,
            format!("chunk-{sequence}").as_bytes(),
        );
        channel.handle_incoming(&frame).await;
    }

    let delivered: Vec<i64> = seen.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(delivered, vec![0, 1, 2]);
    assert_eq!(transport.acknowledges().len(), 3);
    assert_eq!(channel.expected_sequence_number(), 3);
}

// S4: an unacknowledged message is retransmitted byte-identically until the
// cap, then the resend-timeout rendezvous fires.
#[tokio::test]
async fn unacknowledged_message_hits_resend_cap() {
    let (channel, transport) = channel_with_config(DataChannelConfig {
        resend_sleep_interval: Duration::from_millis(5),
        resend_max_attempt: 3,
        default_transmission_timeout: Duration::from_millis(1),
        ..Default::default()
    });

    channel
        .send_input_data(PayloadType::Output, b"x")
        .await
        .unwrap();
    channel.start_resend_scheduler();

    tokio::time::timeout(Duration::from_secs(5), channel.wait_for_resend_timeout())
        .await
        .expect("resend timeout signalled");

    let raw = transport.binary.lock().unwrap().clone();
    assert_eq!(raw.len(), 4, "original send plus three retransmissions");
    assert!(raw.windows(2).all(|w| w[0] == w[1]), "identical bytes each time");

    let first = ClientMessage::deserialize(&raw[0]).unwrap();
    let last = ClientMessage::deserialize(&raw[3]).unwrap();
    assert_eq!(first.sequence_number, last.sequence_number);
    assert_eq!(first.message_id, last.message_id);
}

// S6: channel_closed from the service stops the session and closes the
// transport.
#[tokio::test]
async fn channel_closed_ends_session() {
    let (channel, transport) = channel();

    let payload = serde_json::json!({
        "MessageType": "channel_closed",
        "MessageId": Uuid::new_v4().to_string(),
        "SessionId": "sess-1",
        "SchemaVersion": 1,
        "CreatedDate": "1718000000000",
        "Output": "bye"
    });
    let closed = ClientMessage {
        message_type: CHANNEL_CLOSED_MESSAGE.to_string(),
        schema_version: 1,
        created_date: message::now_millis(),
        message_id: Uuid::new_v4(),
        payload: serde_json::to_vec(&payload).unwrap(),
        ..Default::default()
    };
    let wire = closed.serialize().unwrap();

    assert_eq!(channel.handle_incoming(&wire).await, Dispatch::ChannelClosed);
    assert!(channel.is_session_ended());
    assert!(transport.closed.load(Ordering::SeqCst));
}

// An acknowledge from the agent clears the outgoing buffer so the resend
// scheduler has nothing left to retransmit.
#[tokio::test]
async fn acknowledge_clears_outgoing_buffer() {
    let (channel, transport) = channel();
    channel
        .send_input_data(PayloadType::Output, b"payload")
        .await
        .unwrap();
    assert_eq!(channel.outgoing_buffer_len(), 1);

    let sent = transport.sent_messages();
    let ack = AcknowledgeContent {
        message_type: sent[0].message_type.clone(),
        message_id: sent[0].message_id.to_string(),
        sequence_number: sent[0].sequence_number,
        is_sequential_message: true,
    };
    let ack_frame = ClientMessage::serialize_acknowledge(&ack).unwrap();
    assert_eq!(channel.handle_incoming(&ack_frame).await, Dispatch::Continue);
    assert_eq!(channel.outgoing_buffer_len(), 0);
}
