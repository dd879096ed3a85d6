//! Single-use challenges and the messages signed over them
//!
//! A challenge is bound to `(node_id, scope)`. The signed message is always
//! domain separated by scope so a signature produced for registration can
//! never be replayed as a recovery proof or vice versa.

use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::NodeId;

/// Challenge length in bytes
pub const CHALLENGE_LEN: usize = 32;

const REGISTER_DOMAIN: &[u8] = b"keyhole/register/v1";
const RECOVER_DOMAIN: &[u8] = b"keyhole/recover/v1";

/// What a challenge may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeScope {
    Register,
    Recover,
}

impl std::fmt::Display for ChallengeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register => f.write_str("REGISTER"),
            Self::Recover => f.write_str("RECOVER"),
        }
    }
}

/// A live challenge held by the authenticator
#[derive(Debug, Clone)]
pub struct Challenge {
    pub node_id: NodeId,
    pub scope: ChallengeScope,
    pub value: [u8; CHALLENGE_LEN],
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl Challenge {
    /// Create a fresh random challenge
    pub fn generate(node_id: NodeId, scope: ChallengeScope, ttl: Duration) -> Self {
        let mut value = [0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut value);
        let now = Instant::now();
        Self {
            node_id,
            scope,
            value,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Constant-time comparison against a presented value
    pub fn matches(&self, presented: &[u8]) -> bool {
        if presented.len() != CHALLENGE_LEN {
            return false;
        }
        presented
            .iter()
            .zip(self.value.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Registration metadata covered by the registration signature.
/// Opaque to the gateway beyond being stored and signed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationMetadata {
    #[serde(with = "crate::types::hex_bytes")]
    pub bip32_key: Vec<u8>,
    pub email: Option<String>,
    pub network: String,
}

fn push_len_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u32).to_be_bytes());
    hasher.update(bytes);
}

/// Digest a registering signer must sign
pub fn registration_message(challenge: &[u8], metadata: &RegistrationMetadata) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(REGISTER_DOMAIN);
    hasher.update(challenge);
    push_len_prefixed(&mut hasher, &metadata.bip32_key);
    push_len_prefixed(&mut hasher, metadata.email.as_deref().unwrap_or("").as_bytes());
    push_len_prefixed(&mut hasher, metadata.network.as_bytes());
    hasher.finalize().into()
}

/// Digest a recovering signer must sign
pub fn recovery_message(challenge: &[u8], node_id: &NodeId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(RECOVER_DOMAIN);
    hasher.update(challenge);
    hasher.update(node_id.as_bytes());
    hasher.finalize().into()
}
