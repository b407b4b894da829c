//! Cryptographic primitives for Parley.
//!
//! This crate provides:
//! - Ephemeral X25519 key agreement carried over the signaling channel
//! - Session-bound shared secrets and the commitments registered with the relay
//! - XChaCha20-Poly1305 sealing of chat envelopes
//!
//! # Design
//!
//! The relay only ever sees public keys (inside offer/answer payloads) and a
//! one-way commitment of the derived secret. Both peers derive
//! `SHA-256(label || session_id || X25519(a, B))`, so the secret is bound to
//! the session id it was negotiated under.
//!
//! Envelopes use random 24-byte nonces rather than counters: messages fan out
//! through a relay and may be observed by either peer in any order.

#![forbid(unsafe_code)]

pub mod agreement;
pub mod cipher;
pub mod secret;
pub mod session;

pub use agreement::{AgreementError, KeyAgreement};
pub use cipher::{CipherError, EnvelopeCipher};
pub use secret::SharedSecret;
pub use session::E2eeSession;
