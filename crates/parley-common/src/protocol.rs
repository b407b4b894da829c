use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Metadata header carrying the caller's E2EE session id.
pub const E2EE_SESSION_HEADER: &str = "X-E2EE-Session";

pub const MAX_CONTENT_BYTES: usize = 32 * 1024;
pub const MAX_SIGNAL_PAYLOAD_BYTES: usize = 8 * 1024;
pub const MAX_SESSION_KEY_BYTES: usize = 64;
pub const MAX_SENDER_NAME_CHARS: usize = 64;

/// Server-assigned identity of a live hub connection.
pub type ConnectionId = Uuid;

/// Unit of chat transport. Immutable once built; the relay never rewrites it.
///
/// `content` is plaintext when `encrypted` is false, otherwise the base64
/// encoding of `nonce || ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub channel_id: String,
    pub timestamp: DateTime<Utc>,
    pub encrypted: bool,
}

impl MessageEnvelope {
    /// Bytes bound into the AEAD tag of an encrypted envelope.
    pub fn associated_data(&self) -> Vec<u8> {
        envelope_aad(&self.message_id, &self.channel_id, &self.sender_id)
    }
}

pub fn envelope_aad(message_id: &str, channel_id: &str, sender_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(message_id.len() + channel_id.len() + sender_id.len() + 2);
    aad.extend_from_slice(message_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(channel_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(sender_id.as_bytes());
    aad
}

/// Key-agreement message kinds. The relay routes on the kind only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => f.write_str("offer"),
            SignalKind::Answer => f.write_str("answer"),
            SignalKind::Candidate => f.write_str("candidate"),
        }
    }
}

/// Opaque negotiation payload exchanged between the two ends of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub session_id: String,
    pub kind: SignalKind,
    pub payload: String,
}

impl SignalMessage {
    pub fn new(session_id: impl Into<String>, kind: SignalKind, payload: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            payload: payload.into(),
        }
    }
}

/// Hub methods a client can invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all_fields = "camelCase")]
pub enum HubCall {
    JoinChannel {
        channel_id: String,
    },
    LeaveChannel {
        channel_id: String,
    },
    SendMessage {
        envelope: MessageEnvelope,
    },
    /// Bind a key commitment (base64) to a session id.
    RegisterSession {
        session_id: String,
        key: String,
        #[serde(default)]
        ttl_secs: u64,
    },
    RevokeSession {
        session_id: String,
    },
    JoinSignaling {
        session_id: String,
    },
    Signal(SignalMessage),
}

impl HubCall {
    pub fn name(&self) -> &'static str {
        match self {
            HubCall::JoinChannel { .. } => "JoinChannel",
            HubCall::LeaveChannel { .. } => "LeaveChannel",
            HubCall::SendMessage { .. } => "SendMessage",
            HubCall::RegisterSession { .. } => "RegisterSession",
            HubCall::RevokeSession { .. } => "RevokeSession",
            HubCall::JoinSignaling { .. } => "JoinSignaling",
            HubCall::Signal(_) => "Signal",
        }
    }
}

/// Client-to-server frame: a correlated call plus metadata headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    pub invocation_id: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub call: HubCall,
}

impl Invocation {
    pub fn new(invocation_id: u64, call: HubCall) -> Self {
        Self {
            invocation_id,
            headers: HashMap::new(),
            call,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header lookup, case-insensitive on the name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultCode {
    NotMember,
    InvalidRequest,
    UnknownSession,
    HandshakeRejected,
    RateLimited,
    Internal,
}

impl FaultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::NotMember => "NOT_MEMBER",
            FaultCode::InvalidRequest => "INVALID_REQUEST",
            FaultCode::UnknownSession => "UNKNOWN_SESSION",
            FaultCode::HandshakeRejected => "HANDSHAKE_REJECTED",
            FaultCode::RateLimited => "RATE_LIMITED",
            FaultCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single invocation, reported only to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HubFault {
    pub code: FaultCode,
    pub message: String,
}

impl HubFault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(FaultCode::InvalidRequest, message)
    }
}

/// Server-to-client frames: completions answer invocations, the rest are pushes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerFrame {
    Welcome {
        connection_id: ConnectionId,
    },
    Completion {
        invocation_id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fault: Option<HubFault>,
        #[serde(default)]
        e2ee_verified: bool,
    },
    Message {
        envelope: MessageEnvelope,
        #[serde(default)]
        e2ee_verified: bool,
    },
    Signal(SignalMessage),
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

pub fn is_valid_channel_id(channel_id: &str) -> bool {
    let len = channel_id.len();
    (1..=64).contains(&len)
        && channel_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

pub fn is_valid_session_id(session_id: &str) -> bool {
    let len = session_id.len();
    (8..=128).contains(&len)
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn is_valid_sender_name(name: &str) -> bool {
    let len = name.trim().chars().count();
    (1..=MAX_SENDER_NAME_CHARS).contains(&len) && name.chars().all(|c| !c.is_control())
}

pub fn is_valid_message_id(message_id: &str) -> bool {
    let len = message_id.len();
    (1..=128).contains(&len) && message_id.chars().all(|c| c.is_ascii_graphic())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope {
            message_id: "m-1".into(),
            sender_id: "conn-a".into(),
            sender_name: "alice".into(),
            content: "hello".into(),
            channel_id: "general".into(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            encrypted: false,
        }
    }

    #[test]
    fn test_envelope_wire_field_names() {
        let value = serde_json::to_value(envelope()).unwrap();
        let object = value.as_object().unwrap();
        let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "channelId",
                "content",
                "encrypted",
                "messageId",
                "senderId",
                "senderName",
                "timestamp"
            ]
        );
        assert_eq!(object["timestamp"], "2026-03-01T12:00:00Z");
    }

    #[test]
    fn test_invocation_from_client_json() {
        let text = r#"{
            "invocationId": 7,
            "headers": {"x-e2ee-session": "session-0001"},
            "call": {"method": "JoinChannel", "args": {"channelId": "general"}}
        }"#;
        let invocation = Invocation::decode(text).unwrap();
        assert_eq!(invocation.invocation_id, 7);
        assert_eq!(invocation.header(E2EE_SESSION_HEADER), Some("session-0001"));
        assert_eq!(
            invocation.call,
            HubCall::JoinChannel {
                channel_id: "general".into()
            }
        );
    }

    #[test]
    fn test_signal_call_shape() {
        let call = HubCall::Signal(SignalMessage::new("session-0001", SignalKind::Offer, "pk"));
        let value = serde_json::to_value(Invocation::new(1, call)).unwrap();
        assert_eq!(value["call"]["method"], "Signal");
        assert_eq!(value["call"]["args"]["kind"], "offer");
        assert_eq!(value["call"]["args"]["sessionId"], "session-0001");
        assert!(value.get("headers").is_none());
    }

    #[test]
    fn test_register_session_ttl_defaults_to_zero() {
        let text = r#"{"invocationId":1,"call":{"method":"RegisterSession","args":{"sessionId":"session-0001","key":"AAAA"}}}"#;
        let invocation = Invocation::decode(text).unwrap();
        match invocation.call {
            HubCall::RegisterSession { ttl_secs, .. } => assert_eq!(ttl_secs, 0),
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_server_frame_tags() {
        let completion = ServerFrame::Completion {
            invocation_id: 3,
            fault: Some(HubFault::new(FaultCode::NotMember, "join first")),
            e2ee_verified: false,
        };
        let value = serde_json::to_value(&completion).unwrap();
        assert_eq!(value["type"], "COMPLETION");
        assert_eq!(value["payload"]["invocationId"], 3);
        assert_eq!(value["payload"]["fault"]["code"], "NOT_MEMBER");

        let decoded = ServerFrame::decode(&completion.encode().unwrap()).unwrap();
        assert_eq!(decoded, completion);

        let message = ServerFrame::Message {
            envelope: envelope(),
            e2ee_verified: true,
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "MESSAGE");
        assert_eq!(value["payload"]["e2eeVerified"], true);
        assert_eq!(value["payload"]["envelope"]["messageId"], "m-1");
    }

    #[test]
    fn test_completion_without_fault_omits_field() {
        let frame = ServerFrame::Completion {
            invocation_id: 1,
            fault: None,
            e2ee_verified: true,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value["payload"].get("fault").is_none());
    }

    #[test]
    fn test_aad_separates_fields() {
        assert_ne!(envelope_aad("ab", "c", "d"), envelope_aad("a", "bc", "d"));
        assert_eq!(envelope().associated_data(), envelope_aad("m-1", "general", "conn-a"));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_channel_id("general"));
        assert!(is_valid_channel_id("team-ops.eu_1"));
        assert!(!is_valid_channel_id(""));
        assert!(!is_valid_channel_id("has space"));
        assert!(!is_valid_channel_id(&"c".repeat(65)));

        assert!(is_valid_session_id("6f1c2a0e-9d4b-4f6a-8a77-0f5f1f3c2b10"));
        assert!(!is_valid_session_id("short"));
        assert!(!is_valid_session_id("bad/char-session"));

        assert!(is_valid_sender_name("Alice"));
        assert!(!is_valid_sender_name("   "));
        assert!(!is_valid_sender_name("bell\u{7}"));

        assert!(is_valid_message_id("m-1"));
        assert!(!is_valid_message_id("with space"));
    }
}
