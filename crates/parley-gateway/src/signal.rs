//! Signaling channel for pairwise key agreement.
//!
//! A session admits at most two participants. Messages are routed on their
//! kind only; payloads are never inspected. Anything addressed to a peer that
//! has not enrolled yet waits in a small per-session backlog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_common::{ConnectionId, FaultCode, HubFault, ServerFrame, SignalKind, SignalMessage};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::registry::ConnectionRegistry;

const MAX_PARTICIPANTS: usize = 2;
const MAX_BACKLOG: usize = 32;

struct SignalSession {
    participants: Vec<ConnectionId>,
    backlog: Vec<(ConnectionId, SignalMessage)>,
    last_activity: Instant,
}

impl SignalSession {
    fn new(now: Instant) -> Self {
        Self {
            participants: Vec::with_capacity(MAX_PARTICIPANTS),
            backlog: Vec::new(),
            last_activity: now,
        }
    }

    fn peer_of(&self, conn: ConnectionId) -> Option<ConnectionId> {
        self.participants.iter().copied().find(|id| *id != conn)
    }

    /// Add `conn` unless the pair is already complete.
    fn enroll(&mut self, session_id: &str, conn: ConnectionId) -> Result<(), HubFault> {
        if self.participants.contains(&conn) {
            return Ok(());
        }
        if self.participants.len() >= MAX_PARTICIPANTS {
            warn!("rejected third participant {} for session {}", conn, session_id);
            return Err(HubFault::new(
                FaultCode::HandshakeRejected,
                format!("session {} already has two participants", session_id),
            ));
        }
        self.participants.push(conn);
        Ok(())
    }

    /// Backlog entries that were sent by someone other than `conn`.
    fn take_backlog_for(&mut self, conn: ConnectionId) -> Vec<SignalMessage> {
        let (mine, rest): (Vec<_>, Vec<_>) = self
            .backlog
            .drain(..)
            .partition(|(sender, _)| *sender != conn);
        self.backlog = rest;
        mine.into_iter().map(|(_, msg)| msg).collect()
    }
}

pub struct SignalingHub {
    registry: Arc<ConnectionRegistry>,
    sessions: RwLock<HashMap<String, SignalSession>>,
    ttl: Duration,
}

impl SignalingHub {
    pub fn new(registry: Arc<ConnectionRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Route a signaling message to the other participant of its session.
    pub async fn relay(&self, from: ConnectionId, msg: SignalMessage) -> Result<(), HubFault> {
        let now = Instant::now();
        let mut guard = self.sessions.write().await;

        if msg.kind != SignalKind::Offer && !guard.contains_key(&msg.session_id) {
            return Err(HubFault::new(
                FaultCode::UnknownSession,
                format!("no signaling session {}", msg.session_id),
            ));
        }
        let session = guard
            .entry(msg.session_id.clone())
            .or_insert_with(|| SignalSession::new(now));

        let newly_enrolled = !session.participants.contains(&from);
        session.enroll(&msg.session_id, from)?;
        session.last_activity = now;

        if newly_enrolled {
            for pending in session.take_backlog_for(from) {
                self.deliver(from, pending).await;
            }
        }

        match session.peer_of(from) {
            Some(peer) => {
                debug!("{} {} -> {} ({})", msg.kind, from, peer, msg.session_id);
                self.deliver(peer, msg).await;
            }
            None => {
                if session.backlog.len() >= MAX_BACKLOG {
                    return Err(HubFault::new(
                        FaultCode::RateLimited,
                        format!("signaling backlog for {} is full", msg.session_id),
                    ));
                }
                debug!("queued {} from {} until a peer joins {}", msg.kind, from, msg.session_id);
                session.backlog.push((from, msg));
            }
        }
        Ok(())
    }

    /// Enroll a responder and hand it whatever the other side already sent.
    pub async fn join(&self, from: ConnectionId, session_id: &str) -> Result<(), HubFault> {
        let now = Instant::now();
        let mut guard = self.sessions.write().await;
        let session = guard
            .entry(session_id.to_string())
            .or_insert_with(|| SignalSession::new(now));

        session.enroll(session_id, from)?;
        session.last_activity = now;

        let pending = session.take_backlog_for(from);
        if !pending.is_empty() {
            debug!("flushing {} signals to {} for {}", pending.len(), from, session_id);
        }
        for msg in pending {
            self.deliver(from, msg).await;
        }
        Ok(())
    }

    /// Remove a closing connection from every session it took part in.
    pub async fn disconnect(&self, conn: ConnectionId) -> usize {
        let mut guard = self.sessions.write().await;
        let mut affected = 0;
        guard.retain(|_, session| {
            let before = session.participants.len();
            session.participants.retain(|id| *id != conn);
            session.backlog.retain(|(sender, _)| *sender != conn);
            if session.participants.len() != before {
                affected += 1;
            }
            !session.participants.is_empty()
        });
        affected
    }

    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.sessions.write().await;
        let before = guard.len();
        guard.retain(|_, session| now.duration_since(session.last_activity) < self.ttl);
        let removed = before - guard.len();
        if removed > 0 {
            info!("expired {} idle signaling sessions", removed);
        }
        removed
    }

    pub async fn participants(&self, session_id: &str) -> Vec<ConnectionId> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|session| session.participants.clone())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn deliver(&self, to: ConnectionId, msg: SignalMessage) {
        let kind = msg.kind;
        if !self.registry.send_frame(&to, &ServerFrame::Signal(msg)).await {
            warn!("failed to queue {} signal for {}", kind, to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Outbound, Outbox};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const SESSION: &str = "session-0001";

    async fn attach(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(16);
        registry.insert(id, Outbox::new(tx)).await;
        (id, rx)
    }

    fn signals(rx: &mut mpsc::Receiver<Outbound>) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            if let ServerFrame::Signal(msg) = ServerFrame::decode(&text).unwrap() {
                out.push(msg);
            }
        }
        out
    }

    fn hub(registry: &Arc<ConnectionRegistry>) -> SignalingHub {
        SignalingHub::new(Arc::clone(registry), Duration::from_secs(120))
    }

    #[tokio::test]
    async fn test_offer_is_held_until_responder_joins() {
        let registry = Arc::new(ConnectionRegistry::new());
        let signaling = hub(&registry);
        let (a, mut rx_a) = attach(&registry).await;
        let (b, mut rx_b) = attach(&registry).await;

        let offer = SignalMessage::new(SESSION, SignalKind::Offer, "pk-a");
        signaling.relay(a, offer.clone()).await.unwrap();
        assert!(signals(&mut rx_b).is_empty());

        signaling.join(b, SESSION).await.unwrap();
        assert_eq!(signals(&mut rx_b), vec![offer]);

        let answer = SignalMessage::new(SESSION, SignalKind::Answer, "pk-b");
        signaling.relay(b, answer.clone()).await.unwrap();
        assert_eq!(signals(&mut rx_a), vec![answer]);
        assert_eq!(signaling.participants(SESSION).await, vec![a, b]);
    }

    #[tokio::test]
    async fn test_responder_may_join_before_offer() {
        let registry = Arc::new(ConnectionRegistry::new());
        let signaling = hub(&registry);
        let (a, _rx_a) = attach(&registry).await;
        let (b, mut rx_b) = attach(&registry).await;

        signaling.join(b, SESSION).await.unwrap();
        let offer = SignalMessage::new(SESSION, SignalKind::Offer, "pk-a");
        signaling.relay(a, offer.clone()).await.unwrap();
        assert_eq!(signals(&mut rx_b), vec![offer]);
    }

    #[tokio::test]
    async fn test_answer_for_unknown_session_fails_locally() {
        let registry = Arc::new(ConnectionRegistry::new());
        let signaling = hub(&registry);
        let (a, _rx_a) = attach(&registry).await;

        for kind in [SignalKind::Answer, SignalKind::Candidate] {
            let fault = signaling
                .relay(a, SignalMessage::new("session-missing", kind, "x"))
                .await
                .unwrap_err();
            assert_eq!(fault.code, FaultCode::UnknownSession);
        }
        assert!(signaling.is_empty().await);
    }

    #[tokio::test]
    async fn test_third_participant_is_rejected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let signaling = hub(&registry);
        let (a, mut rx_a) = attach(&registry).await;
        let (b, mut rx_b) = attach(&registry).await;
        let (c, _rx_c) = attach(&registry).await;

        signaling
            .relay(a, SignalMessage::new(SESSION, SignalKind::Offer, "pk-a"))
            .await
            .unwrap();
        signaling.join(b, SESSION).await.unwrap();
        signals(&mut rx_b);

        let fault = signaling.join(c, SESSION).await.unwrap_err();
        assert_eq!(fault.code, FaultCode::HandshakeRejected);
        let fault = signaling
            .relay(c, SignalMessage::new(SESSION, SignalKind::Offer, "pk-c"))
            .await
            .unwrap_err();
        assert_eq!(fault.code, FaultCode::HandshakeRejected);

        assert!(signals(&mut rx_a).is_empty());
        assert!(signals(&mut rx_b).is_empty());
        assert_eq!(signaling.participants(SESSION).await, vec![a, b]);
    }

    #[tokio::test]
    async fn test_candidates_route_both_ways() {
        let registry = Arc::new(ConnectionRegistry::new());
        let signaling = hub(&registry);
        let (a, mut rx_a) = attach(&registry).await;
        let (b, mut rx_b) = attach(&registry).await;
        signaling
            .relay(a, SignalMessage::new(SESSION, SignalKind::Offer, "pk-a"))
            .await
            .unwrap();
        signaling.join(b, SESSION).await.unwrap();
        signals(&mut rx_b);

        let from_a = SignalMessage::new(SESSION, SignalKind::Candidate, "cand-a");
        let from_b = SignalMessage::new(SESSION, SignalKind::Candidate, "cand-b");
        signaling.relay(a, from_a.clone()).await.unwrap();
        signaling.relay(b, from_b.clone()).await.unwrap();
        assert_eq!(signals(&mut rx_b), vec![from_a]);
        assert_eq!(signals(&mut rx_a), vec![from_b]);
    }

    #[tokio::test]
    async fn test_disconnect_frees_slot() {
        let registry = Arc::new(ConnectionRegistry::new());
        let signaling = hub(&registry);
        let (a, _rx_a) = attach(&registry).await;
        let (b, _rx_b) = attach(&registry).await;
        let (c, _rx_c) = attach(&registry).await;
        signaling
            .relay(a, SignalMessage::new(SESSION, SignalKind::Offer, "pk-a"))
            .await
            .unwrap();
        signaling.join(b, SESSION).await.unwrap();

        assert_eq!(signaling.disconnect(b).await, 1);
        signaling.join(c, SESSION).await.unwrap();
        assert_eq!(signaling.participants(SESSION).await, vec![a, c]);

        signaling.disconnect(a).await;
        signaling.disconnect(c).await;
        assert!(signaling.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_expire() {
        let registry = Arc::new(ConnectionRegistry::new());
        let signaling = SignalingHub::new(Arc::clone(&registry), Duration::from_secs(10));
        let (a, _rx_a) = attach(&registry).await;
        signaling
            .relay(a, SignalMessage::new(SESSION, SignalKind::Offer, "pk-a"))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(signaling.sweep_expired().await, 0);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(signaling.sweep_expired().await, 1);
    }
}
