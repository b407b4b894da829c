use parley_common::{FaultCode, HubFault};
use thiserror::Error;

/// Client-side failures. Cloneable so they can ride on state and message events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("not connected")]
    NotConnected,

    #[error("could not decrypt message {message_id}: {reason}")]
    DecryptionFailure { message_id: String, reason: String },

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("a connection is already active")]
    AlreadyActive,

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("rejected by gateway ({code}): {message}")]
    Rejected { code: FaultCode, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<HubFault> for ClientError {
    fn from(fault: HubFault) -> Self {
        match fault.code {
            FaultCode::HandshakeRejected => ClientError::HandshakeRejected(fault.message),
            FaultCode::UnknownSession => ClientError::SessionNotFound(fault.message),
            code => ClientError::Rejected {
                code,
                message: fault.message,
            },
        }
    }
}
