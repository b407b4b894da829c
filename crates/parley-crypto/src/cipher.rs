//! Envelope encryption.
//!
//! # Wire Format
//!
//! ```text
//! base64( [24 bytes: nonce] [ciphertext] [16 bytes: auth tag] )
//! ```
//!
//! The associated data is supplied by the caller (message id, channel id and
//! sender id) so a ciphertext cannot be replayed under different metadata.

use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

use crate::secret::SharedSecret;

pub const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failed")]
    Encrypt,

    #[error("ciphertext is not valid base64")]
    Encoding,

    #[error("ciphertext is truncated")]
    Truncated,

    #[error("authentication failed: wrong key or tampered envelope")]
    Authentication,

    #[error("plaintext is not valid utf-8")]
    Utf8,
}

pub struct EnvelopeCipher {
    cipher: XChaCha20Poly1305,
}

impl EnvelopeCipher {
    pub fn new(secret: &SharedSecret) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(secret.as_bytes())),
        }
    }

    /// Encrypt and encode for an envelope's `content` field.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CipherError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(blob))
    }

    pub fn open(&self, encoded: &str, aad: &[u8]) -> Result<Vec<u8>, CipherError> {
        let blob = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| CipherError::Encoding)?;
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Truncated);
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CipherError::Authentication)
    }

    pub fn open_text(&self, encoded: &str, aad: &[u8]) -> Result<String, CipherError> {
        let plaintext = self.open(encoded, aad)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Utf8)
    }
}

impl fmt::Debug for EnvelopeCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EnvelopeCipher { .. }")
    }
}
