//! Executes decoded hub calls on behalf of one connection.

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parley_common::{
    is_valid_channel_id, is_valid_message_id, is_valid_sender_name, is_valid_session_id,
    ConnectionId, FaultCode, HubCall, HubFault, MessageEnvelope, SignalMessage, MAX_CONTENT_BYTES,
    MAX_SESSION_KEY_BYTES, MAX_SIGNAL_PAYLOAD_BYTES,
};
use tracing::{debug, info, trace};

use crate::gate::CallContext;
use crate::GatewayState;

/// Per-connection state the dispatcher carries between calls.
#[derive(Debug)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    /// Session ids this connection registered. Only these may be revoked by
    /// it, and all of them are revoked when it closes.
    pub registered_sessions: HashSet<String>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            registered_sessions: HashSet::new(),
        }
    }
}

pub async fn dispatch(
    state: &GatewayState,
    conn: &mut ConnectionContext,
    ctx: &CallContext,
    call: HubCall,
) -> Result<(), HubFault> {
    match call {
        HubCall::JoinChannel { channel_id } => {
            check_channel(&channel_id)?;
            state.hub.join(conn.id, &channel_id).await;
            Ok(())
        }
        HubCall::LeaveChannel { channel_id } => {
            check_channel(&channel_id)?;
            state.hub.leave(conn.id, &channel_id).await;
            Ok(())
        }
        HubCall::SendMessage { envelope } => send_message(state, conn, ctx, envelope).await,
        HubCall::RegisterSession {
            session_id,
            key,
            ttl_secs,
        } => {
            check_session(&session_id)?;
            let commitment = STANDARD
                .decode(key.trim())
                .map_err(|_| HubFault::invalid("session key is not valid base64"))?;
            if commitment.is_empty() || commitment.len() > MAX_SESSION_KEY_BYTES {
                return Err(HubFault::invalid(format!(
                    "session key must be 1..={} bytes",
                    MAX_SESSION_KEY_BYTES
                )));
            }

            let ttl = state.config.session_ttl_for(ttl_secs);
            state.sessions.register(&session_id, commitment, ttl).await;
            info!("{} registered session {}", conn.id, session_id);
            conn.registered_sessions.insert(session_id);
            Ok(())
        }
        HubCall::RevokeSession { session_id } => {
            if !conn.registered_sessions.remove(&session_id) {
                return Err(HubFault::new(
                    FaultCode::UnknownSession,
                    format!("session {} was not registered by this connection", session_id),
                ));
            }
            state.sessions.revoke(&session_id).await;
            info!("{} revoked session {}", conn.id, session_id);
            Ok(())
        }
        HubCall::JoinSignaling { session_id } => {
            check_session(&session_id)?;
            state.signaling.join(conn.id, &session_id).await
        }
        HubCall::Signal(msg) => {
            check_signal(&msg)?;
            state.signaling.relay(conn.id, msg).await
        }
    }
}

async fn send_message(
    state: &GatewayState,
    conn: &ConnectionContext,
    ctx: &CallContext,
    envelope: MessageEnvelope,
) -> Result<(), HubFault> {
    check_channel(&envelope.channel_id)?;
    if !is_valid_message_id(&envelope.message_id) {
        return Err(HubFault::invalid("invalid message id"));
    }
    if !is_valid_sender_name(&envelope.sender_name) {
        return Err(HubFault::invalid("invalid sender name"));
    }
    if envelope.sender_id != conn.id.to_string() {
        return Err(HubFault::invalid("senderId must be the caller's connection id"));
    }
    if envelope.content.len() > MAX_CONTENT_BYTES {
        return Err(HubFault::invalid(format!(
            "message content exceeds {} bytes",
            MAX_CONTENT_BYTES
        )));
    }

    let report = state
        .hub
        .broadcast(conn.id, &envelope, ctx.e2ee_enabled)
        .await
        .map_err(HubFault::from)?;

    if ctx.e2ee_enabled {
        trace!(
            "relayed {} to {} ({} delivered, {} dropped)",
            envelope.message_id,
            envelope.channel_id,
            report.delivered,
            report.dropped
        );
    } else {
        debug!(
            "relayed unverified {} (encrypted={}) to {} ({} delivered, {} dropped)",
            envelope.message_id,
            envelope.encrypted,
            envelope.channel_id,
            report.delivered,
            report.dropped
        );
    }
    Ok(())
}

fn check_channel(channel_id: &str) -> Result<(), HubFault> {
    if is_valid_channel_id(channel_id) {
        Ok(())
    } else {
        Err(HubFault::invalid(format!("invalid channel id {:?}", channel_id)))
    }
}

fn check_session(session_id: &str) -> Result<(), HubFault> {
    if is_valid_session_id(session_id) {
        Ok(())
    } else {
        Err(HubFault::invalid("invalid session id"))
    }
}

fn check_signal(msg: &SignalMessage) -> Result<(), HubFault> {
    check_session(&msg.session_id)?;
    if msg.payload.len() > MAX_SIGNAL_PAYLOAD_BYTES {
        return Err(HubFault::invalid(format!(
            "signal payload exceeds {} bytes",
            MAX_SIGNAL_PAYLOAD_BYTES
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::registry::{Outbound, Outbox};
    use chrono::Utc;
    use parley_common::ServerFrame;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn connect(state: &GatewayState) -> (ConnectionContext, mpsc::Receiver<Outbound>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(16);
        state.registry.insert(id, Outbox::new(tx)).await;
        (ConnectionContext::new(id), rx)
    }

    fn plain(conn: &ConnectionContext) -> CallContext {
        CallContext {
            connection_id: conn.id,
            session_id: None,
            e2ee_enabled: false,
        }
    }

    fn envelope(conn: &ConnectionContext, channel: &str, content: &str) -> MessageEnvelope {
        MessageEnvelope {
            message_id: Uuid::new_v4().to_string(),
            sender_id: conn.id.to_string(),
            sender_name: "alice".into(),
            content: content.into(),
            channel_id: channel.into(),
            timestamp: Utc::now(),
            encrypted: false,
        }
    }

    #[tokio::test]
    async fn test_join_then_send_echoes_to_sender() {
        let state = GatewayState::new(GatewayConfig::default());
        let (mut conn, mut rx) = connect(&state).await;
        let ctx = plain(&conn);

        dispatch(
            &state,
            &mut conn,
            &ctx,
            HubCall::JoinChannel {
                channel_id: "general".into(),
            },
        )
        .await
        .unwrap();

        let sent = envelope(&conn, "general", "hello");
        dispatch(
            &state,
            &mut conn,
            &ctx,
            HubCall::SendMessage {
                envelope: sent.clone(),
            },
        )
        .await
        .unwrap();

        let Outbound::Text(text) = rx.recv().await.unwrap() else {
            panic!("expected a text frame");
        };
        assert_eq!(
            ServerFrame::decode(&text).unwrap(),
            ServerFrame::Message {
                envelope: sent,
                e2ee_verified: false
            }
        );
    }

    #[tokio::test]
    async fn test_send_without_join_is_not_member() {
        let state = GatewayState::new(GatewayConfig::default());
        let (mut conn, _rx) = connect(&state).await;
        let ctx = plain(&conn);
        let call = HubCall::SendMessage {
            envelope: envelope(&conn, "general", "hello"),
        };
        let fault = dispatch(&state, &mut conn, &ctx, call).await.unwrap_err();
        assert_eq!(fault.code, FaultCode::NotMember);
    }

    #[tokio::test]
    async fn test_input_validation() {
        let state = GatewayState::new(GatewayConfig::default());
        let (mut conn, _rx) = connect(&state).await;
        let ctx = plain(&conn);

        let fault = dispatch(
            &state,
            &mut conn,
            &ctx,
            HubCall::JoinChannel {
                channel_id: "no spaces".into(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(fault.code, FaultCode::InvalidRequest);

        let mut spoofed = envelope(&conn, "general", "hi");
        spoofed.sender_id = Uuid::new_v4().to_string();
        let fault = dispatch(&state, &mut conn, &ctx, HubCall::SendMessage { envelope: spoofed })
            .await
            .unwrap_err();
        assert_eq!(fault.code, FaultCode::InvalidRequest);

        let oversized = envelope(&conn, "general", &"x".repeat(MAX_CONTENT_BYTES + 1));
        let fault = dispatch(
            &state,
            &mut conn,
            &ctx,
            HubCall::SendMessage {
                envelope: oversized,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(fault.code, FaultCode::InvalidRequest);

        let fault = dispatch(
            &state,
            &mut conn,
            &ctx,
            HubCall::RegisterSession {
                session_id: "session-0001".into(),
                key: "not base64!".into(),
                ttl_secs: 0,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(fault.code, FaultCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_register_and_revoke_session() {
        let state = GatewayState::new(GatewayConfig::default());
        let (mut conn, _rx) = connect(&state).await;
        let (mut other, _rx_other) = connect(&state).await;
        let ctx = plain(&conn);

        dispatch(
            &state,
            &mut conn,
            &ctx,
            HubCall::RegisterSession {
                session_id: "session-0001".into(),
                key: STANDARD.encode([9u8; 32]),
                ttl_secs: 60,
            },
        )
        .await
        .unwrap();
        assert!(state.sessions.lookup("session-0001").await.is_some());

        let other_ctx = plain(&other);
        let fault = dispatch(
            &state,
            &mut other,
            &other_ctx,
            HubCall::RevokeSession {
                session_id: "session-0001".into(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(fault.code, FaultCode::UnknownSession);
        assert!(state.sessions.lookup("session-0001").await.is_some());

        dispatch(
            &state,
            &mut conn,
            &ctx,
            HubCall::RevokeSession {
                session_id: "session-0001".into(),
            },
        )
        .await
        .unwrap();
        assert!(state.sessions.lookup("session-0001").await.is_none());
    }
}
