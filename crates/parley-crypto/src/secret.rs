//! Session-bound shared secrets.

use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

const DERIVE_LABEL: &[u8] = b"parley/e2ee/secret/v1";
const COMMIT_LABEL: &[u8] = b"parley/e2ee/commitment/v1";

/// 32-byte secret shared by the two ends of a signaling session.
///
/// Never leaves the client. The relay receives [`SharedSecret::commitment`]
/// instead.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    /// Derive the session secret from a raw X25519 output.
    pub(crate) fn derive(session_id: &str, dh_output: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DERIVE_LABEL);
        hasher.update((session_id.len() as u64).to_be_bytes());
        hasher.update(session_id.as_bytes());
        hasher.update(dh_output);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// One-way commitment registered with the relay's session store.
    pub fn commitment(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(COMMIT_LABEL);
        hasher.update(self.0);
        hasher.finalize().into()
    }

    pub fn commitment_base64(&self) -> String {
        general_purpose::STANDARD.encode(self.commitment())
    }

    /// Short hex fingerprint users can compare out of band.
    pub fn fingerprint(&self) -> String {
        let commitment = self.commitment();
        hex::encode(&commitment[..8])
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedSecret").field(&"<redacted>").finish()
    }
}
