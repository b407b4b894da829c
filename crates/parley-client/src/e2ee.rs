//! Client side of the pairwise key agreement.
//!
//! Tracks agreements this client has started, and the single session whose
//! secret encrypts outgoing traffic.

use std::collections::HashMap;
use std::sync::Arc;

use parley_common::{SignalKind, SignalMessage};
use parley_crypto::{E2eeSession, KeyAgreement};
use tracing::debug;
use uuid::Uuid;

use crate::error::ClientError;

/// Public view of the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E2eeInfo {
    pub session_id: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

struct PendingAgreement {
    role: Role,
    agreement: KeyAgreement,
}

pub(crate) enum SignalAction {
    Ignore,
    Candidate {
        session_id: String,
        payload: String,
    },
    /// `reply` is the answer a responder must send back.
    Established {
        session: Arc<E2eeSession>,
        reply: Option<SignalMessage>,
    },
    Failed {
        session_id: String,
        error: ClientError,
    },
}

#[derive(Default)]
pub(crate) struct E2eeState {
    pending: HashMap<String, PendingAgreement>,
    active: Option<Arc<E2eeSession>>,
}

impl E2eeState {
    /// Start an exchange under a fresh session id; returns the offer to send.
    pub fn begin_initiator(&mut self) -> (String, SignalMessage) {
        let session_id = Uuid::new_v4().to_string();
        let agreement = KeyAgreement::new();
        let offer = SignalMessage::new(
            session_id.clone(),
            SignalKind::Offer,
            agreement.public_key_base64(),
        );
        self.pending.insert(
            session_id.clone(),
            PendingAgreement {
                role: Role::Initiator,
                agreement,
            },
        );
        (session_id, offer)
    }

    /// Wait for the offer of an exchange someone else started.
    pub fn begin_responder(&mut self, session_id: &str) {
        self.pending.insert(
            session_id.to_string(),
            PendingAgreement {
                role: Role::Responder,
                agreement: KeyAgreement::new(),
            },
        );
    }

    pub fn abandon(&mut self, session_id: &str) {
        self.pending.remove(session_id);
    }

    pub fn active(&self) -> Option<Arc<E2eeSession>> {
        self.active.clone()
    }

    pub fn info(&self) -> Option<E2eeInfo> {
        self.active.as_ref().map(|session| E2eeInfo {
            session_id: session.session_id().to_string(),
            fingerprint: session.fingerprint(),
        })
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.active = None;
    }

    pub fn on_signal(&mut self, msg: &SignalMessage) -> SignalAction {
        let expected = match msg.kind {
            SignalKind::Candidate => {
                return SignalAction::Candidate {
                    session_id: msg.session_id.clone(),
                    payload: msg.payload.clone(),
                }
            }
            SignalKind::Offer => Role::Responder,
            SignalKind::Answer => Role::Initiator,
        };

        match self.pending.get(&msg.session_id) {
            Some(pending) if pending.role == expected => {}
            _ => {
                debug!("ignoring unexpected {} for {}", msg.kind, msg.session_id);
                return SignalAction::Ignore;
            }
        }
        let Some(pending) = self.pending.remove(&msg.session_id) else {
            return SignalAction::Ignore;
        };

        let reply = match expected {
            Role::Responder => Some(SignalMessage::new(
                msg.session_id.clone(),
                SignalKind::Answer,
                pending.agreement.public_key_base64(),
            )),
            Role::Initiator => None,
        };

        match pending.agreement.complete(&msg.session_id, &msg.payload) {
            Ok(secret) => {
                let session = Arc::new(E2eeSession::new(msg.session_id.clone(), secret));
                self.active = Some(Arc::clone(&session));
                SignalAction::Established { session, reply }
            }
            Err(err) => SignalAction::Failed {
                session_id: msg.session_id.clone(),
                error: ClientError::Encryption(err.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn establish(action: SignalAction) -> (Arc<E2eeSession>, Option<SignalMessage>) {
        match action {
            SignalAction::Established { session, reply } => (session, reply),
            _ => panic!("expected an established session"),
        }
    }

    #[test]
    fn test_offer_answer_establishes_both_sides() {
        let mut alice = E2eeState::default();
        let mut bob = E2eeState::default();

        let (session_id, offer) = alice.begin_initiator();
        bob.begin_responder(&session_id);

        let (bob_session, answer) = establish(bob.on_signal(&offer));
        let answer = answer.expect("responder replies with an answer");
        assert_eq!(answer.kind, SignalKind::Answer);

        let (alice_session, reply) = establish(alice.on_signal(&answer));
        assert!(reply.is_none());

        assert_eq!(alice_session.commitment_base64(), bob_session.commitment_base64());
        assert_eq!(alice.info(), bob.info());
        assert_eq!(alice.info().unwrap().session_id, session_id);
    }

    #[test]
    fn test_unsolicited_signals_are_ignored() {
        let mut state = E2eeState::default();
        let stray = SignalMessage::new("session-0001", SignalKind::Answer, "AAAA");
        assert!(matches!(state.on_signal(&stray), SignalAction::Ignore));

        let (session_id, offer) = state.begin_initiator();
        // An initiator never accepts an offer for its own session.
        assert!(matches!(state.on_signal(&offer), SignalAction::Ignore));
        assert!(state.active().is_none());

        state.abandon(&session_id);
        let answer = SignalMessage::new(session_id, SignalKind::Answer, offer.payload);
        assert!(matches!(state.on_signal(&answer), SignalAction::Ignore));
    }

    #[test]
    fn test_bad_offer_fails_handshake() {
        let mut state = E2eeState::default();
        state.begin_responder("session-0001");
        let offer = SignalMessage::new("session-0001", SignalKind::Offer, "not-a-key");
        match state.on_signal(&offer) {
            SignalAction::Failed { session_id, error } => {
                assert_eq!(session_id, "session-0001");
                assert!(matches!(error, ClientError::Encryption(_)));
            }
            _ => panic!("expected failure"),
        }
        assert!(state.active().is_none());
    }

    #[test]
    fn test_candidates_pass_through() {
        let mut state = E2eeState::default();
        let msg = SignalMessage::new("session-0001", SignalKind::Candidate, "relay:1");
        match state.on_signal(&msg) {
            SignalAction::Candidate {
                session_id,
                payload,
            } => {
                assert_eq!(session_id, "session-0001");
                assert_eq!(payload, "relay:1");
            }
            _ => panic!("expected candidate"),
        }
    }
}
