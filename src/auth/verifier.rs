//! Proof-of-possession verification

use ed25519_dalek::{Signature, SIGNATURE_LENGTH};

use crate::types::{KeyholeError, NodeId, Result};

/// Verifies that a signature over `message` was produced by the key behind `node_id`
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, node_id: &NodeId, message: &[u8], signature: &[u8]) -> Result<()>;
}

/// Ed25519 strict verification, the node id being the verifying key
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, node_id: &NodeId, message: &[u8], signature: &[u8]) -> Result<()> {
        let key = node_id.verifying_key()?;
        let sig_bytes: &[u8; SIGNATURE_LENGTH] = signature.try_into().map_err(|_| {
            KeyholeError::Authentication(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_LENGTH,
                signature.len()
            ))
        })?;
        let sig = Signature::from_bytes(sig_bytes);
        key.verify_strict(message, &sig)
            .map_err(|_| KeyholeError::Authentication("invalid signature".into()))
    }
}
