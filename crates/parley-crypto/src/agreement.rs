//! Ephemeral X25519 key agreement.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator                    Relay                    Responder
//!     |  offer(session, e_A)     |                          |
//!     |------------------------->|   (buffered until join)  |
//!     |                          |------------------------->|
//!     |                          |     answer(session, e_B) |
//!     |<-------------------------|<-------------------------|
//!     |                          |                          |
//!     [  both derive SHA-256(label || session || DH(e_A, e_B)) ]
//! ```
//!
//! The relay sees only the two public keys.

use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::secret::SharedSecret;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgreementError {
    #[error("peer public key is not valid base64")]
    Encoding,

    #[error("peer public key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("key agreement produced a non-contributory secret")]
    NonContributory,
}

/// One side of a pending handshake. Consumed on completion.
pub struct KeyAgreement {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyAgreement {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Public key as carried in offer/answer payloads.
    pub fn public_key_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.public.as_bytes())
    }

    /// Finish the exchange with the peer's base64 public key.
    pub fn complete(
        self,
        session_id: &str,
        peer_public_base64: &str,
    ) -> Result<SharedSecret, AgreementError> {
        let peer = decode_public_key(peer_public_base64)?;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(AgreementError::NonContributory);
        }
        Ok(SharedSecret::derive(session_id, shared.as_bytes()))
    }
}

impl Default for KeyAgreement {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeyAgreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyAgreement")
            .field("public", &self.public_key_base64())
            .finish_non_exhaustive()
    }
}

fn decode_public_key(encoded: &str) -> Result<PublicKey, AgreementError> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AgreementError::Encoding)?;
    let raw: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| AgreementError::KeyLength(bytes.len()))?;
    Ok(PublicKey::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_sides_derive_same_secret() {
        let initiator = KeyAgreement::new();
        let responder = KeyAgreement::new();
        let offer = initiator.public_key_base64();
        let answer = responder.public_key_base64();

        let a = initiator.complete("session-0001", &answer).unwrap();
        let b = responder.complete("session-0001", &offer).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.commitment(), b.commitment());
    }

    #[test]
    fn test_rejects_malformed_peer_key() {
        let agreement = KeyAgreement::new();
        assert_eq!(
            agreement.complete("session-0001", "not base64!").unwrap_err(),
            AgreementError::Encoding
        );

        let agreement = KeyAgreement::new();
        let short = general_purpose::STANDARD.encode([1u8; 16]);
        assert_eq!(
            agreement.complete("session-0001", &short).unwrap_err(),
            AgreementError::KeyLength(16)
        );
    }

    #[test]
    fn test_rejects_low_order_point() {
        let agreement = KeyAgreement::new();
        let zero = general_purpose::STANDARD.encode([0u8; 32]);
        assert_eq!(
            agreement.complete("session-0001", &zero).unwrap_err(),
            AgreementError::NonContributory
        );
    }

    #[test]
    fn test_fresh_keys_per_agreement() {
        assert_ne!(KeyAgreement::new().public_key(), KeyAgreement::new().public_key());
    }
}
