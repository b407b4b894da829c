//! Chat relay: channel membership and fan-out of message envelopes.
//!
//! Per connection: `unjoined -> joined(channel) -> unjoined` on leave, and
//! every membership is dropped when the connection closes.
//!
//! A broadcast holds the membership read lock while it enqueues, so it reaches
//! exactly the subscribers present when it started. Enqueueing never waits:
//! a full or closed outbox loses that one delivery and the rest proceed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parley_common::{ConnectionId, FaultCode, HubFault, MessageEnvelope, ServerFrame};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("connection {0} is not a member of channel {1}")]
    NotMember(ConnectionId, String),

    #[error("envelope could not be encoded: {0}")]
    Encoding(String),
}

impl From<HubError> for HubFault {
    fn from(err: HubError) -> Self {
        match err {
            HubError::NotMember(_, channel) => HubFault::new(
                FaultCode::NotMember,
                format!("join channel {} before sending to it", channel),
            ),
            HubError::Encoding(message) => HubFault::new(FaultCode::Internal, message),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct Membership {
    channels: HashMap<String, HashSet<ConnectionId>>,
    joined: HashMap<ConnectionId, HashSet<String>>,
}

pub struct ChatHub {
    registry: Arc<ConnectionRegistry>,
    membership: RwLock<Membership>,
}

impl ChatHub {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            membership: RwLock::new(Membership::default()),
        }
    }

    /// Returns false when the connection was already a member.
    pub async fn join(&self, conn: ConnectionId, channel_id: &str) -> bool {
        let mut guard = self.membership.write().await;
        let added = guard
            .channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(conn);
        if added {
            guard
                .joined
                .entry(conn)
                .or_default()
                .insert(channel_id.to_string());
            debug!("{} joined {}", conn, channel_id);
        }
        added
    }

    /// Returns false when the connection was not a member.
    pub async fn leave(&self, conn: ConnectionId, channel_id: &str) -> bool {
        let mut guard = self.membership.write().await;
        let removed = match guard.channels.get_mut(channel_id) {
            Some(subscribers) => subscribers.remove(&conn),
            None => false,
        };
        if !removed {
            return false;
        }

        if guard
            .channels
            .get(channel_id)
            .is_some_and(|subscribers| subscribers.is_empty())
        {
            guard.channels.remove(channel_id);
        }
        if let Some(channels) = guard.joined.get_mut(&conn) {
            channels.remove(channel_id);
            if channels.is_empty() {
                guard.joined.remove(&conn);
            }
        }
        debug!("{} left {}", conn, channel_id);
        true
    }

    /// Drop every membership of a closing connection.
    pub async fn disconnect(&self, conn: ConnectionId) -> Vec<String> {
        let mut guard = self.membership.write().await;
        let Some(channels) = guard.joined.remove(&conn) else {
            return Vec::new();
        };

        for channel_id in &channels {
            let now_empty = match guard.channels.get_mut(channel_id) {
                Some(subscribers) => {
                    subscribers.remove(&conn);
                    subscribers.is_empty()
                }
                None => false,
            };
            if now_empty {
                guard.channels.remove(channel_id);
            }
        }

        let mut left: Vec<String> = channels.into_iter().collect();
        left.sort();
        left
    }

    pub async fn is_member(&self, conn: ConnectionId, channel_id: &str) -> bool {
        self.membership
            .read()
            .await
            .channels
            .get(channel_id)
            .is_some_and(|subscribers| subscribers.contains(&conn))
    }

    pub async fn subscribers(&self, channel_id: &str) -> Vec<ConnectionId> {
        let guard = self.membership.read().await;
        let mut ids: Vec<ConnectionId> = guard
            .channels
            .get(channel_id)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub async fn channel_count(&self) -> usize {
        self.membership.read().await.channels.len()
    }

    /// Relay an envelope from one of the channel's members to all of them,
    /// the sender included.
    pub async fn broadcast(
        &self,
        sender: ConnectionId,
        envelope: &MessageEnvelope,
        e2ee_verified: bool,
    ) -> Result<BroadcastReport, HubError> {
        let guard = self.membership.read().await;
        let Some(subscribers) = guard
            .channels
            .get(&envelope.channel_id)
            .filter(|set| set.contains(&sender))
        else {
            return Err(HubError::NotMember(sender, envelope.channel_id.clone()));
        };

        let mut report = BroadcastReport::default();
        let text = ServerFrame::Message {
            envelope: envelope.clone(),
            e2ee_verified,
        }
        .encode()
        .map_err(|err| HubError::Encoding(err.to_string()))?;

        for (id, outbox) in self.registry.outboxes_for(subscribers).await {
            if outbox.try_send_text(text.clone()) {
                report.delivered += 1;
            } else {
                report.dropped += 1;
                warn!(
                    "dropped message {} for {} (outbox full or closed)",
                    envelope.message_id, id
                );
            }
        }
        report.dropped += subscribers.len().saturating_sub(report.delivered + report.dropped);
        Ok(report)
    }
}
