//! Established E2EE session.
//!
//! Pairs the negotiated secret with its session id and an envelope cipher.

use crate::cipher::{CipherError, EnvelopeCipher};
use crate::secret::SharedSecret;

#[derive(Debug)]
pub struct E2eeSession {
    session_id: String,
    secret: SharedSecret,
    cipher: EnvelopeCipher,
}

impl E2eeSession {
    pub fn new(session_id: impl Into<String>, secret: SharedSecret) -> Self {
        let cipher = EnvelopeCipher::new(&secret);
        Self {
            session_id: session_id.into(),
            secret,
            cipher,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Commitment to register with the relay under [`Self::session_id`].
    pub fn commitment_base64(&self) -> String {
        self.secret.commitment_base64()
    }

    pub fn fingerprint(&self) -> String {
        self.secret.fingerprint()
    }

    pub fn seal(&self, plaintext: &str, aad: &[u8]) -> Result<String, CipherError> {
        self.cipher.seal(plaintext.as_bytes(), aad)
    }

    pub fn open(&self, content: &str, aad: &[u8]) -> Result<String, CipherError> {
        self.cipher.open_text(content, aad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::KeyAgreement;

    fn create_session_pair(session_id: &str) -> (E2eeSession, E2eeSession) {
        let initiator = KeyAgreement::new();
        let responder = KeyAgreement::new();
        let offer = initiator.public_key_base64();
        let answer = responder.public_key_base64();

        let a = initiator.complete(session_id, &answer).unwrap();
        let b = responder.complete(session_id, &offer).unwrap();
        (E2eeSession::new(session_id, a), E2eeSession::new(session_id, b))
    }

    #[test]
    fn test_encrypted_session() {
        let (alice, bob) = create_session_pair("session-0001");

        let sealed = alice.seal("hello from alice", b"aad").unwrap();
        assert_eq!(bob.open(&sealed, b"aad").unwrap(), "hello from alice");

        let sealed = bob.seal("hello from bob", b"aad").unwrap();
        assert_eq!(alice.open(&sealed, b"aad").unwrap(), "hello from bob");
    }

    #[test]
    fn test_peers_agree_on_commitment() {
        let (alice, bob) = create_session_pair("session-0001");
        assert_eq!(alice.commitment_base64(), bob.commitment_base64());
        assert_eq!(alice.fingerprint(), bob.fingerprint());
        assert_eq!(alice.session_id(), "session-0001");
    }

    #[test]
    fn test_unrelated_session_cannot_open() {
        let (alice, _) = create_session_pair("session-0001");
        let (mallory, _) = create_session_pair("session-0001");
        let sealed = alice.seal("private", b"").unwrap();
        assert_eq!(
            mallory.open(&sealed, b"").unwrap_err(),
            CipherError::Authentication
        );
    }
}
