//! Shared helpers: an authenticator over an in-memory store and a node key
//! that registers itself the way a client would.

#![allow(dead_code)]

use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use keyhole::auth::{
    recovery_message, registration_message, AuthConfig, AuthenticatedNode, Authenticator,
    CertificateIssuer, ChallengeScope, CredentialBundle, CredentialStore, Ed25519Verifier,
    RecoverParams, RegisterParams, RegistrationMetadata,
};
use keyhole::{NodeId, Result};

pub fn authenticator(store: CredentialStore) -> Arc<Authenticator> {
    Arc::new(Authenticator::new(
        AuthConfig::default(),
        Arc::new(store),
        Arc::new(Ed25519Verifier),
    ))
}

pub fn in_memory_authenticator() -> Arc<Authenticator> {
    authenticator(CredentialStore::in_memory(CertificateIssuer::generate()))
}

pub struct TestNode {
    pub key: SigningKey,
}

impl TestNode {
    pub fn new() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn id(&self) -> NodeId {
        NodeId::from(self.key.verifying_key())
    }

    pub fn metadata(&self) -> RegistrationMetadata {
        RegistrationMetadata {
            bip32_key: vec![0x04; 78],
            email: Some("node@example.com".to_string()),
            network: "regtest".to_string(),
        }
    }

    pub fn register_params(&self, challenge: &[u8]) -> RegisterParams {
        let metadata = self.metadata();
        let signature = self.key.sign(&registration_message(challenge, &metadata));
        RegisterParams {
            node_id: self.id(),
            metadata,
            challenge: challenge.to_vec(),
            signature: signature.to_bytes().to_vec(),
        }
    }

    pub fn recover_params(&self, challenge: &[u8]) -> RecoverParams {
        let signature = self.key.sign(&recovery_message(challenge, &self.id()));
        RecoverParams {
            node_id: self.id(),
            challenge: challenge.to_vec(),
            signature: signature.to_bytes().to_vec(),
        }
    }

    pub async fn register(&self, auth: &Authenticator) -> CredentialBundle {
        let challenge = auth.get_challenge(self.id(), ChallengeScope::Register).await;
        auth.register(self.register_params(&challenge))
            .await
            .expect("registration succeeds")
    }

    pub async fn recover(&self, auth: &Authenticator) -> CredentialBundle {
        let challenge = auth.get_challenge(self.id(), ChallengeScope::Recover).await;
        auth.recover(self.recover_params(&challenge))
            .await
            .expect("recovery succeeds")
    }

    /// Register and present the issued credentials
    pub async fn authenticated(&self, auth: &Authenticator) -> AuthenticatedNode {
        let bundle = self.register(auth).await;
        present(auth.store(), &bundle).expect("fresh certificate authenticates")
    }
}

/// Present `bundle` on a signed GET /v1/hsm/signer, as a device does
pub fn present(store: &CredentialStore, bundle: &CredentialBundle) -> Result<AuthenticatedNode> {
    let certificate = bundle.certificate()?;
    let timestamp = chrono::Utc::now().timestamp();
    let proof = bundle.sign_request("GET", "/v1/hsm/signer", timestamp)?;
    store.authenticate(&certificate, "GET", "/v1/hsm/signer", &proof)
}
