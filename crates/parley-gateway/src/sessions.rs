//! Key/session store.
//!
//! Binds session ids to the key commitment clients register after a
//! signaling handshake. Callers outside this module only learn whether a live
//! binding exists, never its bytes.

use std::collections::HashMap;
use std::time::Duration;

use parley_common::helpers::constant_time_eq;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use zeroize::Zeroizing;

struct SessionEntry {
    secret: Zeroizing<Vec<u8>>,
    created_at: Instant,
    expires_at: Instant,
}

impl SessionEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Result of a successful lookup. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPresence {
    pub session_id: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

#[derive(Default)]
pub struct SessionStore {
    entries: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a binding. Replaces any previous secret for the id in one step.
    pub async fn register(&self, session_id: &str, secret: Vec<u8>, ttl: Duration) {
        let now = Instant::now();
        let entry = SessionEntry {
            secret: Zeroizing::new(secret),
            created_at: now,
            expires_at: now + ttl,
        };

        let mut guard = self.entries.write().await;
        if let Some(previous) = guard.get(session_id) {
            if previous.is_live(now) && !constant_time_eq(&previous.secret, &entry.secret) {
                warn!(
                    "session {} re-registered with different key material",
                    session_id
                );
            }
        }
        guard.insert(session_id.to_string(), entry);
        debug!("registered session {} for {}s", session_id, ttl.as_secs());
    }

    /// Expired entries read as absent even before the sweeper removes them.
    pub async fn lookup(&self, session_id: &str) -> Option<SessionPresence> {
        let now = Instant::now();
        let guard = self.entries.read().await;
        let entry = guard.get(session_id)?;
        if !entry.is_live(now) {
            return None;
        }
        Some(SessionPresence {
            session_id: session_id.to_string(),
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        })
    }

    pub async fn revoke(&self, session_id: &str) -> bool {
        let removed = self.entries.write().await.remove(session_id).is_some();
        if removed {
            debug!("revoked session {}", session_id);
        }
        removed
    }

    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.entries.write().await;
        let before = guard.len();
        guard.retain(|_, entry| entry.is_live(now));
        before - guard.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_then_lookup() {
        let store = SessionStore::new();
        assert!(store.lookup("session-0001").await.is_none());

        store
            .register("session-0001", vec![1; 32], Duration::from_secs(60))
            .await;
        let presence = store.lookup("session-0001").await.unwrap();
        assert_eq!(presence.session_id, "session-0001");
        assert!(presence.expires_at > presence.created_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_reads_as_absent() {
        let store = SessionStore::new();
        store
            .register("session-0001", vec![1; 32], Duration::from_millis(50))
            .await;
        assert!(store.lookup("session-0001").await.is_some());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(store.lookup("session-0001").await.is_none());

        // Still physically present until swept.
        assert_eq!(store.len().await, 1);
        assert_eq!(store.sweep_expired().await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_replaces_and_extends() {
        let store = SessionStore::new();
        store
            .register("session-0001", vec![1; 32], Duration::from_secs(10))
            .await;
        tokio::time::advance(Duration::from_secs(8)).await;
        store
            .register("session-0001", vec![2; 32], Duration::from_secs(10))
            .await;
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(store.lookup("session-0001").await.is_some());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_revoke() {
        let store = SessionStore::new();
        store
            .register("session-0001", vec![1; 32], Duration::from_secs(60))
            .await;
        assert!(store.revoke("session-0001").await);
        assert!(!store.revoke("session-0001").await);
        assert!(store.lookup("session-0001").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_register_and_lookup() {
        let store = Arc::new(SessionStore::new());
        let mut tasks = Vec::new();
        for i in 0..32u8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .register("session-shared", vec![i; 32], Duration::from_secs(60))
                    .await;
                store.lookup("session-shared").await.is_some()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(store.len().await, 1);
    }
}
