//! JSON payloads carried inside data-channel frames.
//!
//! Field names are part of the wire contract with the agent and the managed
//! session service; serde rename attributes reproduce them exactly. Binary
//! fields travel as base64 strings, matching the service's JSON encoding of
//! byte arrays.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Handshake action asking the client to set up KMS envelope encryption.
pub const ACTION_KMS_ENCRYPTION: &str = "KMSEncryption";
/// Handshake action telling the client which session type to run.
pub const ACTION_SESSION_TYPE: &str = "SessionType";

/// Payload of an `acknowledge` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeContent {
    /// Message type of the acknowledged frame.
    #[serde(rename = "AcknowledgeMessageType")]
    pub message_type: String,
    /// Message id of the acknowledged frame.
    #[serde(rename = "MessageId")]
    pub message_id: String,
    /// Sequence number of the acknowledged frame.
    #[serde(rename = "SequenceNumber")]
    pub sequence_number: i64,
    /// Always true; retained for agent compatibility.
    #[serde(rename = "IsSequentialMessage")]
    pub is_sequential_message: bool,
}

/// Payload of a `channel_closed` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelClosed {
    #[serde(rename = "MessageType")]
    pub message_type: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "DestinationId")]
    pub destination_id: String,
    #[serde(rename = "SessionId")]
    pub session_id: String,
    #[serde(rename = "SchemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "CreatedDate")]
    pub created_date: String,
    /// Final words from the service, displayed to the user.
    #[serde(rename = "Output")]
    pub output: String,
}

/// One action the agent asks the client to process during handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedClientAction {
    #[serde(rename = "ActionType")]
    pub action_type: String,
    /// Action-specific parameters, parsed by the matching handler.
    #[serde(rename = "ActionParameters", default)]
    pub action_parameters: serde_json::Value,
}

/// Payload of a handshake request (payload type 5).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeRequestPayload {
    #[serde(rename = "AgentVersion")]
    pub agent_version: String,
    #[serde(rename = "RequestedClientActions")]
    pub requested_client_actions: Vec<RequestedClientAction>,
}

/// Outcome of a processed handshake action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u32)]
pub enum ActionStatus {
    Success = 1,
    Failed = 2,
    Unsupported = 3,
}

/// One processed action reported back to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedClientAction {
    #[serde(rename = "ActionType")]
    pub action_type: String,
    #[serde(rename = "ActionStatus")]
    pub action_status: ActionStatus,
    /// Action-specific result, e.g. the wrapped data key for KMSEncryption.
    #[serde(rename = "ActionResult", skip_serializing_if = "Option::is_none")]
    pub action_result: Option<serde_json::Value>,
    #[serde(rename = "Error", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a handshake response (payload type 6).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeResponsePayload {
    #[serde(rename = "ClientVersion")]
    pub client_version: String,
    #[serde(rename = "ProcessedClientActions")]
    pub processed_client_actions: Vec<ProcessedClientAction>,
    #[serde(rename = "Errors", skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Payload of a handshake complete (payload type 7).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeCompletePayload {
    /// Time the agent measured for the whole handshake, in nanoseconds.
    #[serde(rename = "HandshakeTimeToComplete")]
    pub handshake_time_to_complete_ns: i64,
    /// Optional message the agent wants shown to the user.
    #[serde(rename = "CustomerMessage")]
    pub customer_message: String,
}

/// Parameters of the `SessionType` handshake action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTypeRequest {
    #[serde(rename = "SessionType")]
    pub session_type: String,
    /// Session-specific properties, forwarded opaquely to the handler.
    #[serde(rename = "Properties")]
    pub properties: serde_json::Value,
}

/// Parameters of the `KMSEncryption` handshake action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsEncryptionRequest {
    #[serde(rename = "KMSKeyId")]
    pub kms_key_id: String,
}

/// Result attached to a successful `KMSEncryption` action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmsEncryptionResponse {
    /// The KMS-wrapped data key, for the agent to unwrap.
    #[serde(rename = "KMSCipherTextKey", with = "base64_bytes")]
    pub kms_cipher_text_key: Vec<u8>,
}

/// Payload of an encryption challenge request (payload type 8).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionChallengeRequest {
    #[serde(rename = "Challenge", with = "base64_bytes")]
    pub challenge: Vec<u8>,
}

/// Payload of an encryption challenge response (payload type 9).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionChallengeResponse {
    #[serde(rename = "Challenge", with = "base64_bytes")]
    pub challenge: Vec<u8>,
}

/// Terminal dimensions, sent as a `Size` payload when the terminal resizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeData {
    pub cols: u32,
    pub rows: u32,
}

/// First frame on a freshly dialed channel: a JSON text frame presenting the
/// channel token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDataChannelInput {
    #[serde(rename = "MessageSchemaVersion")]
    pub message_schema_version: String,
    #[serde(rename = "RequestId")]
    pub request_id: String,
    #[serde(rename = "TokenValue")]
    pub token_value: String,
    #[serde(rename = "ClientId")]
    pub client_id: String,
    #[serde(rename = "ClientVersion")]
    pub client_version: String,
}

/// Serde adapter encoding byte fields as base64 strings.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_content_wire_names() {
        let content = AcknowledgeContent {
            message_type: "output_stream_data".to_string(),
            message_id: "abc".to_string(),
            sequence_number: 3,
            is_sequential_message: true,
        };
        let json: serde_json::Value = serde_json::to_value(&content).unwrap();
        assert_eq!(json["AcknowledgeMessageType"], "output_stream_data");
        assert_eq!(json["MessageId"], "abc");
        assert_eq!(json["SequenceNumber"], 3);
        assert_eq!(json["IsSequentialMessage"], true);
    }

    #[test]
    fn test_handshake_request_parses_raw_action_parameters() {
        let raw = r#"{
            "AgentVersion": "3.1.0.0",
            "RequestedClientActions": [
                {"ActionType": "KMSEncryption", "ActionParameters": {"KMSKeyId": "alias/key"}},
                {"ActionType": "SessionType", "ActionParameters": {"SessionType": "Standard_Stream", "Properties": null}}
            ]
        }"#;
        let request: HandshakeRequestPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(request.agent_version, "3.1.0.0");
        assert_eq!(request.requested_client_actions.len(), 2);

        let kms: KmsEncryptionRequest =
            serde_json::from_value(request.requested_client_actions[0].action_parameters.clone())
                .unwrap();
        assert_eq!(kms.kms_key_id, "alias/key");

        let session: SessionTypeRequest =
            serde_json::from_value(request.requested_client_actions[1].action_parameters.clone())
                .unwrap();
        assert_eq!(session.session_type, "Standard_Stream");
    }

    #[test]
    fn test_action_status_wire_values() {
        assert_eq!(serde_json::to_string(&ActionStatus::Success).unwrap(), "1");
        assert_eq!(serde_json::to_string(&ActionStatus::Failed).unwrap(), "2");
        assert_eq!(serde_json::to_string(&ActionStatus::Unsupported).unwrap(), "3");
        let status: ActionStatus = serde_json::from_str("2").unwrap();
        assert_eq!(status, ActionStatus::Failed);
    }

    #[test]
    fn test_handshake_response_serialization() {
        let response = HandshakeResponsePayload {
            client_version: "1.2.0".to_string(),
            processed_client_actions: vec![ProcessedClientAction {
                action_type: ACTION_SESSION_TYPE.to_string(),
                action_status: ActionStatus::Success,
                action_result: None,
                error: None,
            }],
            errors: Vec::new(),
        };
        let json: serde_json::Value = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ClientVersion"], "1.2.0");
        assert_eq!(json["ProcessedClientActions"][0]["ActionStatus"], 1);
        assert!(json["ProcessedClientActions"][0].get("Error").is_none());
        assert!(json.get("Errors").is_none(), "empty error list is omitted");
    }

    #[test]
    fn test_challenge_bytes_travel_as_base64() {
        let request = EncryptionChallengeRequest {
            challenge: vec![1, 2, 3, 255],
        };
        let json: serde_json::Value = serde_json::to_value(&request).unwrap();
        assert_eq!(json["Challenge"], "AQID/w==");

        let back: EncryptionChallengeRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.challenge, vec![1, 2, 3, 255]);
    }

    #[test]
    fn test_channel_closed_tolerates_missing_fields() {
        let closed: ChannelClosed = serde_json::from_str(r#"{"Output": "bye"}"#).unwrap();
        assert_eq!(closed.output, "bye");
        assert!(closed.session_id.is_empty());
    }

    #[test]
    fn test_open_data_channel_input_wire_names() {
        let input = OpenDataChannelInput {
            message_schema_version: "1.0".to_string(),
            request_id: "req".to_string(),
            token_value: "tok".to_string(),
            client_id: "client".to_string(),
            client_version: "1.2.0".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&input).unwrap();
        assert_eq!(json["MessageSchemaVersion"], "1.0");
        assert_eq!(json["RequestId"], "req");
        assert_eq!(json["TokenValue"], "tok");
        assert_eq!(json["ClientId"], "client");
        assert_eq!(json["ClientVersion"], "1.2.0");
    }

    #[test]
    fn test_size_data_lower_case_names() {
        let json = serde_json::to_string(&SizeData { cols: 120, rows: 40 }).unwrap();
        assert_eq!(json, r#"{"cols":120,"rows":40}"#);
    }

    #[test]
    fn test_handshake_complete_nanoseconds() {
        let complete: HandshakeCompletePayload = serde_json::from_str(
            r#"{"HandshakeTimeToComplete": 1500000000, "CustomerMessage": "hi"}"#,
        )
        .unwrap();
        assert_eq!(complete.handshake_time_to_complete_ns, 1_500_000_000);
        assert_eq!(complete.customer_message, "hi");
    }
}
