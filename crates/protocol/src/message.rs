//! Binary frame codec for data-channel client messages.
//!
//! # Frame Format
//!
//! Every message on the data channel is a fixed-layout header followed by a
//! variable-length payload. All integers are big-endian:
//!
//! ```text
//! offset   0: header length  (u32)   byte offset of the PayloadLength field
//! offset   4: message type   (32 bytes, ASCII, right-padded with spaces)
//! offset  36: schema version (u32)
//! offset  40: created date   (u64)   milliseconds since the Unix epoch
//! offset  48: sequence number (i64)
//! offset  56: flags          (u64)
//! offset  64: message id     (16 bytes, UUID as two big-endian longs,
//!                             least-significant half first)
//! offset  80: payload digest (32 bytes, SHA-256 of the payload)
//! offset 112: payload type   (u32)
//! offset 116: payload length (u32)
//! offset 120: payload        (payload length bytes)
//! ```
//!
//! The digest is written on serialization but deliberately not checked on
//! deserialization; [`ClientMessage::validate`] performs that check so the
//! caller decides when a frame must be trustworthy.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::payload::AcknowledgeContent;

/// Message type for client-to-agent stream data.
pub const INPUT_STREAM_MESSAGE: &str = "input_stream_data";
/// Message type for agent-to-client stream data.
pub const OUTPUT_STREAM_MESSAGE: &str = "output_stream_data";
/// Message type for stream-data acknowledgements.
pub const ACKNOWLEDGE_MESSAGE: &str = "acknowledge";
/// Message type sent by the service when the channel is being torn down.
pub const CHANNEL_CLOSED_MESSAGE: &str = "channel_closed";
/// Publication-control message: resume publishing.
pub const START_PUBLICATION_MESSAGE: &str = "start_publication";
/// Publication-control message: pause publishing.
pub const PAUSE_PUBLICATION_MESSAGE: &str = "pause_publication";

/// Byte offset of the header-length field.
pub const HL_OFFSET: usize = 0;
/// Byte offset of the message-type field.
pub const MESSAGE_TYPE_OFFSET: usize = 4;
/// Width of the message-type field.
pub const MESSAGE_TYPE_LENGTH: usize = 32;
/// Byte offset of the schema-version field.
pub const SCHEMA_VERSION_OFFSET: usize = 36;
/// Byte offset of the created-date field.
pub const CREATED_DATE_OFFSET: usize = 40;
/// Byte offset of the sequence-number field.
pub const SEQUENCE_NUMBER_OFFSET: usize = 48;
/// Byte offset of the flags field.
pub const FLAGS_OFFSET: usize = 56;
/// Byte offset of the message-id field.
pub const MESSAGE_ID_OFFSET: usize = 64;
/// Width of the message-id field.
pub const MESSAGE_ID_LENGTH: usize = 16;
/// Byte offset of the payload-digest field.
pub const PAYLOAD_DIGEST_OFFSET: usize = 80;
/// Width of the payload-digest field.
pub const PAYLOAD_DIGEST_LENGTH: usize = 32;
/// Byte offset of the payload-type field.
pub const PAYLOAD_TYPE_OFFSET: usize = 112;
/// Byte offset of the payload-length field. Doubles as the header length
/// written into every serialized frame.
pub const PAYLOAD_LENGTH_OFFSET: usize = 116;
/// Byte offset of the payload.
pub const PAYLOAD_OFFSET: usize = 120;

/// Payload type carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadType {
    /// Shell or stream output bytes.
    Output = 1,
    /// Error output bytes.
    Error = 2,
    /// Terminal size payload.
    Size = 3,
    /// Session parameter payload.
    Parameter = 4,
    /// Handshake request from the agent.
    HandshakeRequest = 5,
    /// Handshake response from the client.
    HandshakeResponse = 6,
    /// Handshake completion from the agent.
    HandshakeComplete = 7,
    /// Encryption challenge from the agent.
    EncChallengeRequest = 8,
    /// Encryption challenge answer from the client.
    EncChallengeResponse = 9,
    /// Control flag payload (4-byte big-endian enum).
    Flag = 10,
    /// Standard-error stream bytes.
    StdErr = 11,
    /// Process exit code.
    ExitCode = 12,
}

impl PayloadType {
    /// Maps a wire value back to a payload type.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Output),
            2 => Some(Self::Error),
            3 => Some(Self::Size),
            4 => Some(Self::Parameter),
            5 => Some(Self::HandshakeRequest),
            6 => Some(Self::HandshakeResponse),
            7 => Some(Self::HandshakeComplete),
            8 => Some(Self::EncChallengeRequest),
            9 => Some(Self::EncChallengeResponse),
            10 => Some(Self::Flag),
            11 => Some(Self::StdErr),
            12 => Some(Self::ExitCode),
            _ => None,
        }
    }
}

/// Control flag carried in the body of a [`PayloadType::Flag`] message as a
/// 4-byte big-endian integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PayloadTypeFlag {
    /// The local peer disconnected; the agent should close its server-side
    /// connection but keep the channel alive.
    DisconnectToPort = 1,
    /// The user asked to end the session.
    TerminateSession = 2,
    /// The agent could not connect to the requested port.
    ConnectToPortError = 3,
}

impl PayloadTypeFlag {
    /// Encodes the flag as its 4-byte big-endian wire form.
    pub fn to_be_bytes(self) -> [u8; 4] {
        (self as u32).to_be_bytes()
    }
}

/// A single data-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    /// Byte offset of the payload-length field, as found on the wire.
    pub header_length: u32,
    /// Message type string, trimmed of padding.
    pub message_type: String,
    /// Schema version, currently 1.
    pub schema_version: u32,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_date: u64,
    /// Per-direction monotonic sequence number, starting at 0.
    pub sequence_number: i64,
    /// Bit flags.
    pub flags: u64,
    /// Message identifier.
    pub message_id: Uuid,
    /// SHA-256 digest of the payload, as found on the wire.
    pub payload_digest: [u8; PAYLOAD_DIGEST_LENGTH],
    /// Payload type discriminant.
    pub payload_type: u32,
    /// Payload length, as found on the wire.
    pub payload_length: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Default for ClientMessage {
    fn default() -> Self {
        Self {
            header_length: 0,
            message_type: String::new(),
            schema_version: 0,
            created_date: 0,
            sequence_number: 0,
            flags: 0,
            message_id: Uuid::nil(),
            payload_digest: [0; PAYLOAD_DIGEST_LENGTH],
            payload_type: 0,
            payload_length: 0,
            payload: Vec::new(),
        }
    }
}

impl ClientMessage {
    /// Serializes the message into its wire form.
    ///
    /// The header length, payload length, and payload digest fields are
    /// computed here; whatever the struct held for them is ignored.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if self.message_id.is_nil() {
            return Err(ProtocolError::Format("message id is nil".to_string()));
        }
        if self.message_type.len() > MESSAGE_TYPE_LENGTH {
            return Err(ProtocolError::Format(format!(
                "message type {:?} exceeds {} bytes",
                self.message_type, MESSAGE_TYPE_LENGTH
            )));
        }

        let payload_length = self.payload.len();
        if u32::try_from(payload_length).is_err() {
            return Err(ProtocolError::Format("payload exceeds u32 length".to_string()));
        }

        let mut out = vec![0u8; PAYLOAD_OFFSET + payload_length];
        out[HL_OFFSET..HL_OFFSET + 4]
            .copy_from_slice(&(PAYLOAD_LENGTH_OFFSET as u32).to_be_bytes());

        // Message type slot is space-filled before the value is copied in.
        out[MESSAGE_TYPE_OFFSET..MESSAGE_TYPE_OFFSET + MESSAGE_TYPE_LENGTH].fill(b' ');
        out[MESSAGE_TYPE_OFFSET..MESSAGE_TYPE_OFFSET + self.message_type.len()]
            .copy_from_slice(self.message_type.as_bytes());

        out[SCHEMA_VERSION_OFFSET..SCHEMA_VERSION_OFFSET + 4]
            .copy_from_slice(&self.schema_version.to_be_bytes());
        out[CREATED_DATE_OFFSET..CREATED_DATE_OFFSET + 8]
            .copy_from_slice(&self.created_date.to_be_bytes());
        out[SEQUENCE_NUMBER_OFFSET..SEQUENCE_NUMBER_OFFSET + 8]
            .copy_from_slice(&self.sequence_number.to_be_bytes());
        out[FLAGS_OFFSET..FLAGS_OFFSET + 8].copy_from_slice(&self.flags.to_be_bytes());

        put_uuid(&mut out, MESSAGE_ID_OFFSET, &self.message_id);

        let digest = Sha256::digest(&self.payload);
        out[PAYLOAD_DIGEST_OFFSET..PAYLOAD_DIGEST_OFFSET + PAYLOAD_DIGEST_LENGTH]
            .copy_from_slice(&digest);

        out[PAYLOAD_TYPE_OFFSET..PAYLOAD_TYPE_OFFSET + 4]
            .copy_from_slice(&self.payload_type.to_be_bytes());
        out[PAYLOAD_LENGTH_OFFSET..PAYLOAD_LENGTH_OFFSET + 4]
            .copy_from_slice(&(payload_length as u32).to_be_bytes());
        out[PAYLOAD_OFFSET..].copy_from_slice(&self.payload);

        Ok(out)
    }

    /// Deserializes a frame from its wire form.
    ///
    /// Every fixed field is read at its schema offset with bounds checking;
    /// the payload is located through the header length found on the wire so
    /// that frames from agents with extended headers still parse.
    pub fn deserialize(input: &[u8]) -> Result<Self> {
        let message_type = get_string(input, MESSAGE_TYPE_OFFSET, MESSAGE_TYPE_LENGTH)?;
        let schema_version = get_u32(input, SCHEMA_VERSION_OFFSET)?;
        let created_date = get_u64(input, CREATED_DATE_OFFSET)?;
        let sequence_number = get_i64(input, SEQUENCE_NUMBER_OFFSET)?;
        let flags = get_u64(input, FLAGS_OFFSET)?;
        let message_id = get_uuid(input, MESSAGE_ID_OFFSET)?;
        let digest_slice = get_bytes(input, PAYLOAD_DIGEST_OFFSET, PAYLOAD_DIGEST_LENGTH)?;
        let payload_type = get_u32(input, PAYLOAD_TYPE_OFFSET)?;
        let payload_length = get_u32(input, PAYLOAD_LENGTH_OFFSET)?;
        let header_length = get_u32(input, HL_OFFSET)?;

        let payload_start = header_length as usize + 4;
        if payload_start > input.len() {
            return Err(ProtocolError::Format(format!(
                "payload offset {} is outside the {}-byte frame",
                payload_start,
                input.len()
            )));
        }

        let mut payload_digest = [0u8; PAYLOAD_DIGEST_LENGTH];
        payload_digest.copy_from_slice(digest_slice);

        Ok(Self {
            header_length,
            message_type,
            schema_version,
            created_date,
            sequence_number,
            flags,
            message_id,
            payload_digest,
            payload_type,
            payload_length,
            payload: input[payload_start..].to_vec(),
        })
    }

    /// Checks the frame for integrity.
    ///
    /// Publication-control messages are exempt from all checks. For every
    /// other frame the header length, message type, and created date must be
    /// present, and a non-empty payload must match its digest.
    pub fn validate(&self) -> Result<()> {
        if self.message_type == START_PUBLICATION_MESSAGE
            || self.message_type == PAUSE_PUBLICATION_MESSAGE
        {
            return Ok(());
        }
        if self.header_length == 0 {
            return Err(ProtocolError::Format("header length cannot be zero".to_string()));
        }
        if self.message_type.is_empty() {
            return Err(ProtocolError::Format("message type is missing".to_string()));
        }
        if self.created_date == 0 {
            return Err(ProtocolError::Format("created date is missing".to_string()));
        }
        if self.payload_length != 0 {
            let digest = Sha256::digest(&self.payload);
            if digest[..] != self.payload_digest {
                return Err(ProtocolError::Integrity("payload hash is not valid".to_string()));
            }
        }
        Ok(())
    }

    /// Builds and serializes an `acknowledge` frame for the given content.
    pub fn serialize_acknowledge(content: &AcknowledgeContent) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(content)?;
        let message = ClientMessage {
            message_type: ACKNOWLEDGE_MESSAGE.to_string(),
            schema_version: 1,
            created_date: now_millis(),
            sequence_number: 0,
            flags: 3,
            message_id: Uuid::new_v4(),
            payload,
            ..Default::default()
        };
        message.serialize()
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn check_bounds(input: &[u8], offset: usize, width: usize) -> Result<()> {
    if offset.checked_add(width).map_or(true, |end| end > input.len()) {
        return Err(ProtocolError::Format(format!(
            "field at offset {} width {} is outside the {}-byte frame",
            offset,
            width,
            input.len()
        )));
    }
    Ok(())
}

fn get_bytes(input: &[u8], offset: usize, width: usize) -> Result<&[u8]> {
    check_bounds(input, offset, width)?;
    Ok(&input[offset..offset + width])
}

fn get_u32(input: &[u8], offset: usize) -> Result<u32> {
    let bytes = get_bytes(input, offset, 4)?;
    Ok(u32::from_be_bytes(bytes.try_into().expect("4-byte slice")))
}

fn get_u64(input: &[u8], offset: usize) -> Result<u64> {
    let bytes = get_bytes(input, offset, 8)?;
    Ok(u64::from_be_bytes(bytes.try_into().expect("8-byte slice")))
}

fn get_i64(input: &[u8], offset: usize) -> Result<i64> {
    let bytes = get_bytes(input, offset, 8)?;
    Ok(i64::from_be_bytes(bytes.try_into().expect("8-byte slice")))
}

/// Reads a fixed-width string slot, stripping trailing NULs and padding.
fn get_string(input: &[u8], offset: usize, width: usize) -> Result<String> {
    let bytes = get_bytes(input, offset, width)?;
    let trimmed: &[u8] = {
        let without_nulls_end = bytes.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
        let without_nulls_start = bytes.iter().position(|&b| b != 0).unwrap_or(0);
        &bytes[without_nulls_start..without_nulls_end]
    };
    let text = String::from_utf8_lossy(trimmed);
    Ok(text.trim().to_string())
}

/// Reads the message-id slot.
///
/// The slot holds the UUID as two big-endian 64-bit halves with the
/// least-significant half at the lower offset, so the halves are swapped
/// back while reconstructing the identifier.
fn get_uuid(input: &[u8], offset: usize) -> Result<Uuid> {
    let bytes = get_bytes(input, offset, MESSAGE_ID_LENGTH)?;
    let mut uuid_bytes = [0u8; MESSAGE_ID_LENGTH];
    uuid_bytes[..8].copy_from_slice(&bytes[8..16]);
    uuid_bytes[8..].copy_from_slice(&bytes[..8]);
    Ok(Uuid::from_bytes(uuid_bytes))
}

/// Writes the message-id slot; the inverse of [`get_uuid`].
fn put_uuid(output: &mut [u8], offset: usize, id: &Uuid) {
    let uuid_bytes = id.as_bytes();
    output[offset..offset + 8].copy_from_slice(&uuid_bytes[8..16]);
    output[offset + 8..offset + 16].copy_from_slice(&uuid_bytes[..8]);
}
