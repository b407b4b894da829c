use std::sync::Arc;

use parley_common::{ConnectionId, Invocation, E2EE_SESSION_HEADER};
use tracing::debug;

use crate::sessions::SessionStore;

/// Verification outcome attached to one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub connection_id: ConnectionId,
    /// Set only when the presented session has a live binding.
    pub session_id: Option<String>,
    /// True only when the presented session has a live binding.
    pub e2ee_enabled: bool,
}

impl CallContext {
    fn unannotated(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            session_id: None,
            e2ee_enabled: false,
        }
    }
}

/// Advisory check of the `X-E2EE-Session` header. It never refuses a call.
pub struct SessionGate {
    store: Arc<SessionStore>,
}

impl SessionGate {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    pub async fn inspect(&self, connection_id: ConnectionId, invocation: &Invocation) -> CallContext {
        let presented = invocation
            .header(E2EE_SESSION_HEADER)
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let Some(id) = presented else {
            return CallContext::unannotated(connection_id);
        };
        if self.store.lookup(id).await.is_none() {
            debug!("{} presented unknown session {}", connection_id, id);
            return CallContext::unannotated(connection_id);
        }

        debug!(
            "E2EE session verified for {} ({}) on {}",
            connection_id,
            id,
            invocation.call.name()
        );
        CallContext {
            connection_id,
            session_id: Some(id.to_string()),
            e2ee_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_common::HubCall;
    use std::time::Duration;
    use uuid::Uuid;

    fn join_call() -> Invocation {
        Invocation::new(
            1,
            HubCall::JoinChannel {
                channel_id: "general".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_no_header_is_unverified() {
        let gate = SessionGate::new(Arc::new(SessionStore::new()));
        let ctx = gate.inspect(Uuid::new_v4(), &join_call()).await;
        assert!(!ctx.e2ee_enabled);
        assert!(ctx.session_id.is_none());
    }

    #[tokio::test]
    async fn test_live_session_is_verified() {
        let store = Arc::new(SessionStore::new());
        store
            .register("session-0001", vec![7; 32], Duration::from_secs(60))
            .await;
        let gate = SessionGate::new(store);

        let invocation = join_call().with_header("x-e2ee-session", "session-0001");
        let ctx = gate.inspect(Uuid::new_v4(), &invocation).await;
        assert!(ctx.e2ee_enabled);
        assert_eq!(ctx.session_id.as_deref(), Some("session-0001"));
    }

    #[tokio::test]
    async fn test_unknown_session_passes_unverified() {
        let gate = SessionGate::new(Arc::new(SessionStore::new()));
        let invocation = join_call().with_header(E2EE_SESSION_HEADER, "session-unknown");
        let ctx = gate.inspect(Uuid::new_v4(), &invocation).await;
        assert!(!ctx.e2ee_enabled);
        assert!(ctx.session_id.is_none());
    }

    #[tokio::test]
    async fn test_blank_header_is_ignored() {
        let gate = SessionGate::new(Arc::new(SessionStore::new()));
        let invocation = join_call().with_header(E2EE_SESSION_HEADER, "   ");
        let ctx = gate.inspect(Uuid::new_v4(), &invocation).await;
        assert!(ctx.session_id.is_none());
    }

    #[tokio::test]
    async fn test_revoked_session_is_unannotated() {
        let store = Arc::new(SessionStore::new());
        store
            .register("session-0002", vec![3; 32], Duration::from_secs(60))
            .await;
        let gate = SessionGate::new(Arc::clone(&store));
        let invocation = join_call().with_header(E2EE_SESSION_HEADER, "session-0002");
        assert!(gate.inspect(Uuid::new_v4(), &invocation).await.e2ee_enabled);

        store.revoke("session-0002").await;
        let id = Uuid::new_v4();
        assert_eq!(
            gate.inspect(id, &invocation).await,
            CallContext {
                connection_id: id,
                session_id: None,
                e2ee_enabled: false,
            }
        );
    }
}
