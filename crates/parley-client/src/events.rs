use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parley_common::MessageEnvelope;
use tokio::sync::mpsc;

use crate::error::ClientError;
use crate::state::ConnectionStatus;

/// An envelope that arrived on a joined channel, with its plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub envelope: MessageEnvelope,
    pub text: String,
    /// The sender's call was tagged with a live E2EE session.
    pub e2ee_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StateChanged(ConnectionStatus),
    Message(ReceivedMessage),
    /// A single envelope could not be opened. The connection stays up.
    MessageError {
        envelope: MessageEnvelope,
        error: ClientError,
    },
    E2eeEstablished {
        session_id: String,
        fingerprint: String,
    },
    Candidate {
        session_id: String,
        payload: String,
    },
    HandshakeFailed {
        session_id: String,
        error: ClientError,
    },
    /// `count` peer events were discarded while the reader was
    /// `event_capacity` events behind. Reported once the backlog is drained.
    EventsDropped { count: u64 },
}

impl ClientEvent {
    fn is_peer_traffic(&self) -> bool {
        matches!(
            self,
            ClientEvent::Message(_) | ClientEvent::MessageError { .. } | ClientEvent::Candidate { .. }
        )
    }
}

#[derive(Default)]
struct Backlog {
    queued: AtomicUsize,
    dropped: AtomicU64,
}

pub(crate) fn event_stream(capacity: usize) -> (EventSink, ClientEvents) {
    let (tx, rx) = mpsc::unbounded_channel();
    let backlog = Arc::new(Backlog::default());
    (
        EventSink {
            tx,
            backlog: Arc::clone(&backlog),
            capacity: capacity.max(1),
        },
        ClientEvents { rx, backlog },
    )
}

/// Sending side, owned by the client. Peer traffic is bounded by `capacity`;
/// lifecycle events always go through.
pub(crate) struct EventSink {
    tx: mpsc::UnboundedSender<ClientEvent>,
    backlog: Arc<Backlog>,
    capacity: usize,
}

impl EventSink {
    pub(crate) fn emit(&self, event: ClientEvent) {
        if event.is_peer_traffic() {
            if self.backlog.queued.load(Ordering::Acquire) >= self.capacity {
                self.backlog.dropped.fetch_add(1, Ordering::AcqRel);
                return;
            }
            self.backlog.queued.fetch_add(1, Ordering::AcqRel);
        }
        let _ = self.tx.send(event);
    }
}

/// Receiving side of a client's event stream.
pub struct ClientEvents {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
    backlog: Arc<Backlog>,
}

impl ClientEvents {
    /// Next event, or `None` once every `ChatClient` handle has been dropped
    /// and the remaining events were read.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        if let Some(event) = self.try_recv() {
            return Some(event);
        }
        let event = self.rx.recv().await?;
        Some(self.taken(event))
    }

    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(self.taken(event)),
            Err(_) => self.lagged(),
        }
    }

    fn taken(&self, event: ClientEvent) -> ClientEvent {
        if event.is_peer_traffic() {
            self.backlog.queued.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }

    fn lagged(&self) -> Option<ClientEvent> {
        let count = self.backlog.dropped.swap(0, Ordering::AcqRel);
        (count > 0).then_some(ClientEvent::EventsDropped { count })
    }
}
