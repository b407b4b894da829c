use std::collections::HashMap;

use parley_common::{ConnectionId, ServerFrame};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

/// Items queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Bounded outbound queue of one connection. Sends never block.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    pub fn try_send_text(&self, text: String) -> bool {
        self.tx.try_send(Outbound::Text(text)).is_ok()
    }

    pub fn try_send_frame(&self, frame: &ServerFrame) -> bool {
        match frame.encode() {
            Ok(text) => self.try_send_text(text),
            Err(err) => {
                warn!("failed to encode server frame: {}", err);
                false
            }
        }
    }

    /// Waits for queue space. Used for replies to the connection's own calls.
    pub async fn send_frame(&self, frame: &ServerFrame) -> bool {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!("failed to encode server frame: {}", err);
                return false;
            }
        };
        self.tx.send(Outbound::Text(text)).await.is_ok()
    }

    pub fn close(&self) -> bool {
        self.tx.try_send(Outbound::Close).is_ok()
    }
}

/// Live connections by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    outboxes: RwLock<HashMap<ConnectionId, Outbox>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: ConnectionId, outbox: Outbox) {
        self.outboxes.write().await.insert(id, outbox);
    }

    pub async fn remove(&self, id: &ConnectionId) -> bool {
        self.outboxes.write().await.remove(id).is_some()
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<Outbox> {
        self.outboxes.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.outboxes.read().await.len()
    }

    pub async fn send_frame(&self, id: &ConnectionId, frame: &ServerFrame) -> bool {
        let Some(outbox) = self.get(id).await else {
            return false;
        };
        outbox.try_send_frame(frame)
    }

    /// Ask the connection's writer to close the socket.
    pub async fn evict(&self, id: &ConnectionId) -> bool {
        match self.get(id).await {
            Some(outbox) => outbox.close(),
            None => false,
        }
    }

    /// Snapshot outboxes for a set of ids, skipping ones that already left.
    pub(crate) async fn outboxes_for<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ConnectionId>,
    ) -> Vec<(ConnectionId, Outbox)> {
        let guard = self.outboxes.read().await;
        ids.into_iter()
            .filter_map(|id| guard.get(id).map(|outbox| (*id, outbox.clone())))
            .collect()
    }
}
