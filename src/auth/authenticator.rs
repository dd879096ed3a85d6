//! Challenge-response authenticator
//!
//! Per identity the protocol is:
//!
//! ```text
//! UNREGISTERED --GetChallenge(REGISTER)--> CHALLENGED_REGISTER --Register ok--> REGISTERED
//! REGISTERED   --GetChallenge(RECOVER)---> CHALLENGED_RECOVER  --Recover ok---> REGISTERED
//! ```
//!
//! At most one live challenge exists per `(identity, scope)`; a new
//! GetChallenge supersedes the previous one. A challenge is consumed only by
//! a fully successful Register/Recover. Consumed values are remembered for a
//! retention window so replays are reported as such.
//!
//! All operations for one identity run under a per-identity async mutex, so
//! challenge consumption, credential issuance and Register/Recover are
//! mutually exclusive for that identity. Idle per-identity mutexes are
//! dropped by the periodic cleanup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::certificate::{CertificateRole, CredentialBundle};
use super::challenge::{
    recovery_message, registration_message, Challenge, ChallengeScope, RegistrationMetadata,
    CHALLENGE_LEN,
};
use super::store::CredentialStore;
use super::verifier::SignatureVerifier;
use crate::types::{KeyholeError, NodeId, Result};

/// Authenticator configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// How long an issued challenge stays valid
    pub challenge_ttl: Duration,
    /// How long consumed challenge values are remembered for replay detection
    pub replay_retention: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            challenge_ttl: Duration::from_secs(300),
            replay_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// A Register call
#[derive(Debug, Clone)]
pub struct RegisterParams {
    pub node_id: NodeId,
    pub metadata: RegistrationMetadata,
    pub challenge: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A Recover call
#[derive(Debug, Clone)]
pub struct RecoverParams {
    pub node_id: NodeId,
    pub challenge: Vec<u8>,
    pub signature: Vec<u8>,
}

struct ConsumedChallenge {
    node_id: NodeId,
    consumed_at: Instant,
}

/// Authenticator statistics
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatorStats {
    pub live_challenges: usize,
    pub consumed_challenges: usize,
    pub identity_locks: usize,
}

/// Issues challenges and grants credentials against verified signatures
pub struct Authenticator {
    config: AuthConfig,
    store: Arc<CredentialStore>,
    verifier: Arc<dyn SignatureVerifier>,
    challenges: DashMap<(NodeId, ChallengeScope), Challenge>,
    consumed: DashMap<[u8; CHALLENGE_LEN], ConsumedChallenge>,
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
}

impl Authenticator {
    pub fn new(
        config: AuthConfig,
        store: Arc<CredentialStore>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            config,
            store,
            verifier,
            challenges: DashMap::new(),
            consumed: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    async fn lock(&self, node_id: &NodeId) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(*node_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Issue a fresh challenge, superseding any live one for the same scope
    pub async fn get_challenge(
        &self,
        node_id: NodeId,
        scope: ChallengeScope,
    ) -> [u8; CHALLENGE_LEN] {
        let _guard = self.lock(&node_id).await;

        let challenge = Challenge::generate(node_id, scope, self.config.challenge_ttl);
        let value = challenge.value;
        if self.challenges.insert((node_id, scope), challenge).is_some() {
            debug!(node_id = %node_id, scope = %scope, "Superseded previous challenge");
        }

        info!(node_id = %node_id, scope = %scope, "Issued challenge");
        value
    }

    /// Register a node, returning its first device credentials
    pub async fn register(&self, params: RegisterParams) -> Result<CredentialBundle> {
        let node_id = params.node_id;
        let _guard = self.lock(&node_id).await;

        self.check_challenge(&node_id, ChallengeScope::Register, &params.challenge)?;

        let message = registration_message(&params.challenge, &params.metadata);
        if let Err(e) = self
            .verifier
            .verify(&node_id, &message, &params.signature)
        {
            warn!(node_id = %node_id, "Registration signature rejected");
            return Err(e);
        }

        let (certificate, bundle) =
            self.store
                .issuer()
                .issue(node_id, CertificateRole::Device, "device")?;
        self.store
            .record_registration(node_id, params.metadata, &certificate)
            .await?;
        self.consume(&node_id, ChallengeScope::Register);

        info!(node_id = %node_id, serial = %certificate.serial(), "Node registered");
        Ok(bundle)
    }

    /// Issue replacement credentials for an already registered node
    pub async fn recover(&self, params: RecoverParams) -> Result<CredentialBundle> {
        let node_id = params.node_id;
        let _guard = self.lock(&node_id).await;

        if !self.store.is_registered(&node_id) {
            warn!(node_id = %node_id, "Recovery attempted for unregistered node");
            return Err(KeyholeError::UnknownIdentity(node_id));
        }

        self.check_challenge(&node_id, ChallengeScope::Recover, &params.challenge)?;

        let message = recovery_message(&params.challenge, &node_id);
        if let Err(e) = self
            .verifier
            .verify(&node_id, &message, &params.signature)
        {
            warn!(node_id = %node_id, "Recovery signature rejected");
            return Err(e);
        }

        let name = format!("recovered-{}", hex::encode(&params.challenge[..8]));
        let (certificate, bundle) =
            self.store
                .issuer()
                .issue(node_id, CertificateRole::Device, name)?;
        self.store.record_recovery(&node_id, &certificate).await?;
        self.consume(&node_id, ChallengeScope::Recover);

        info!(node_id = %node_id, serial = %certificate.serial(), "Node recovered");
        Ok(bundle)
    }

    /// Validate a presented challenge without consuming it
    fn check_challenge(
        &self,
        node_id: &NodeId,
        scope: ChallengeScope,
        presented: &[u8],
    ) -> Result<()> {
        if let Ok(value) = <[u8; CHALLENGE_LEN]>::try_from(presented) {
            if let Some(consumed) = self.consumed.get(&value) {
                warn!(
                    node_id = %node_id,
                    consumed_by = %consumed.node_id,
                    "Replayed challenge rejected"
                );
                return Err(KeyholeError::Replay);
            }
        }

        let key = (*node_id, scope);
        let live = self.challenges.get(&key).ok_or_else(|| {
            KeyholeError::Authentication(format!("no outstanding {} challenge", scope))
        })?;

        if !live.matches(presented) {
            return Err(KeyholeError::Authentication(format!(
                "challenge does not match the outstanding {} challenge",
                scope
            )));
        }

        if live.is_expired() {
            drop(live);
            self.challenges.remove(&key);
            return Err(KeyholeError::Authentication("challenge expired".into()));
        }

        Ok(())
    }

    fn consume(&self, node_id: &NodeId, scope: ChallengeScope) {
        if let Some((_, challenge)) = self.challenges.remove(&(*node_id, scope)) {
            self.consumed.insert(
                challenge.value,
                ConsumedChallenge {
                    node_id: *node_id,
                    consumed_at: Instant::now(),
                },
            );
            debug!(node_id = %node_id, scope = %scope, "Challenge consumed");
        }
    }

    pub fn stats(&self) -> AuthenticatorStats {
        AuthenticatorStats {
            live_challenges: self.challenges.len(),
            consumed_challenges: self.consumed.len(),
            identity_locks: self.locks.len(),
        }
    }

    /// Drop expired challenges, tombstones past the retention window and
    /// identity mutexes nobody holds or waits on
    pub fn cleanup(&self) {
        let before = self.challenges.len() + self.consumed.len();
        self.challenges.retain(|_, c| !c.is_expired());
        let retention = self.config.replay_retention;
        self.consumed
            .retain(|_, c| c.consumed_at.elapsed() < retention);
        let removed = before.saturating_sub(self.challenges.len() + self.consumed.len());
        if removed > 0 {
            debug!("Cleaned up {} challenge records", removed);
        }

        // A held or awaited mutex has a clone outside the map
        let locks = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let idle = locks.saturating_sub(self.locks.len());
        if idle > 0 {
            debug!("Dropped {} idle identity locks", idle);
        }
    }
}

/// Spawn periodic challenge cleanup
pub fn spawn_cleanup_task(
    authenticator: Arc<Authenticator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            authenticator.cleanup();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CertificateIssuer, Ed25519Verifier};
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn authenticator(ttl: Duration) -> Authenticator {
        let store = Arc::new(CredentialStore::in_memory(CertificateIssuer::generate()));
        Authenticator::new(
            AuthConfig {
                challenge_ttl: ttl,
                ..AuthConfig::default()
            },
            store,
            Arc::new(Ed25519Verifier),
        )
    }

    fn metadata() -> RegistrationMetadata {
        RegistrationMetadata {
            bip32_key: vec![0x04, 0x88],
            email: Some("node@example.com".into()),
            network: "testnet".into(),
        }
    }

    fn register_params(key: &SigningKey, challenge: &[u8]) -> RegisterParams {
        let metadata = metadata();
        let sig = key.sign(&registration_message(challenge, &metadata));
        RegisterParams {
            node_id: NodeId::from(key.verifying_key()),
            metadata,
            challenge: challenge.to_vec(),
            signature: sig.to_bytes().to_vec(),
        }
    }

    fn recover_params(key: &SigningKey, challenge: &[u8]) -> RecoverParams {
        let node_id = NodeId::from(key.verifying_key());
        let sig = key.sign(&recovery_message(challenge, &node_id));
        RecoverParams {
            node_id,
            challenge: challenge.to_vec(),
            signature: sig.to_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_register_then_replay() {
        let auth = authenticator(Duration::from_secs(60));
        let key = SigningKey::generate(&mut OsRng);
        let node = NodeId::from(key.verifying_key());

        let challenge = auth.get_challenge(node, ChallengeScope::Register).await;
        let bundle = auth.register(register_params(&key, &challenge)).await.unwrap();
        assert!(!bundle.is_empty());
        assert!(auth.store().is_registered(&node));

        let replay = auth.register(register_params(&key, &challenge)).await;
        assert_eq!(replay.unwrap_err(), KeyholeError::Replay);
    }

    #[tokio::test]
    async fn test_replay_detected_even_with_bad_signature() {
        let auth = authenticator(Duration::from_secs(60));
        let key = SigningKey::generate(&mut OsRng);
        let node = NodeId::from(key.verifying_key());

        let challenge = auth.get_challenge(node, ChallengeScope::Register).await;
        auth.register(register_params(&key, &challenge)).await.unwrap();

        let mut params = register_params(&key, &challenge);
        params.signature = vec![0u8; 64];
        assert_eq!(auth.register(params).await.unwrap_err(), KeyholeError::Replay);
    }

    #[tokio::test]
    async fn test_superseded_challenge_rejected() {
        let auth = authenticator(Duration::from_secs(60));
        let key = SigningKey::generate(&mut OsRng);
        let node = NodeId::from(key.verifying_key());

        let first = auth.get_challenge(node, ChallengeScope::Register).await;
        let second = auth.get_challenge(node, ChallengeScope::Register).await;

        assert!(matches!(
            auth.register(register_params(&key, &first)).await,
            Err(KeyholeError::Authentication(_))
        ));
        assert!(auth.register(register_params(&key, &second)).await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_signature_leaves_challenge_live() {
        let auth = authenticator(Duration::from_secs(60));
        let key = SigningKey::generate(&mut OsRng);
        let node = NodeId::from(key.verifying_key());

        let challenge = auth.get_challenge(node, ChallengeScope::Register).await;
        let mut bad = register_params(&key, &challenge);
        bad.metadata.network = "bitcoin".into();
        assert!(matches!(
            auth.register(bad).await,
            Err(KeyholeError::Authentication(_))
        ));
        assert!(!auth.store().is_registered(&node));

        assert!(auth.register(register_params(&key, &challenge)).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_scope_rejected() {
        let auth = authenticator(Duration::from_secs(60));
        let key = SigningKey::generate(&mut OsRng);
        let node = NodeId::from(key.verifying_key());

        let register = auth.get_challenge(node, ChallengeScope::Register).await;
        auth.register(register_params(&key, &register)).await.unwrap();

        let recover = auth.get_challenge(node, ChallengeScope::Recover).await;
        assert!(matches!(
            auth.register(register_params(&key, &recover)).await,
            Err(KeyholeError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_challenge_rejected() {
        let auth = authenticator(Duration::from_millis(1));
        let key = SigningKey::generate(&mut OsRng);
        let node = NodeId::from(key.verifying_key());

        let challenge = auth.get_challenge(node, ChallengeScope::Register).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            auth.register(register_params(&key, &challenge)).await,
            Err(KeyholeError::Authentication(_))
        ));
        assert_eq!(auth.stats().live_challenges, 0);
    }

    #[tokio::test]
    async fn test_recover_requires_registration() {
        let auth = authenticator(Duration::from_secs(60));
        let key = SigningKey::generate(&mut OsRng);
        let node = NodeId::from(key.verifying_key());

        let challenge = auth.get_challenge(node, ChallengeScope::Recover).await;
        assert_eq!(
            auth.recover(recover_params(&key, &challenge)).await.unwrap_err(),
            KeyholeError::UnknownIdentity(node)
        );
    }

    #[tokio::test]
    async fn test_recover_issues_new_credentials() {
        let auth = authenticator(Duration::from_secs(60));
        let key = SigningKey::generate(&mut OsRng);
        let node = NodeId::from(key.verifying_key());

        let challenge = auth.get_challenge(node, ChallengeScope::Register).await;
        let first = auth.register(register_params(&key, &challenge)).await.unwrap();

        let challenge = auth.get_challenge(node, ChallengeScope::Recover).await;
        let second = auth.recover(recover_params(&key, &challenge)).await.unwrap();

        let first_cert = first.certificate().unwrap();
        let second_cert = second.certificate().unwrap();
        assert_ne!(first_cert.serial(), second_cert.serial());
        assert!(second_cert.body.name.starts_with("recovered-"));
        let now = chrono::Utc::now().timestamp();
        for (cert, bundle) in [(&first_cert, &first), (&second_cert, &second)] {
            assert_eq!(cert.role(), CertificateRole::Device);
            let proof = bundle.sign_request("GET", "/v1/hsm/signer", now).unwrap();
            assert!(auth
                .store()
                .authenticate(cert, "GET", "/v1/hsm/signer", &proof)
                .is_ok());
        }
    }

    #[tokio::test]
    async fn test_register_signature_from_other_key_rejected() {
        let auth = authenticator(Duration::from_secs(60));
        let key = SigningKey::generate(&mut OsRng);
        let impostor = SigningKey::generate(&mut OsRng);
        let node = NodeId::from(key.verifying_key());

        let challenge = auth.get_challenge(node, ChallengeScope::Register).await;
        let mut params = register_params(&impostor, &challenge);
        params.node_id = node;
        assert!(matches!(
            auth.register(params).await,
            Err(KeyholeError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_cleanup_drops_expired() {
        let auth = authenticator(Duration::from_millis(1));
        auth.get_challenge(NodeId::from_bytes([1; 32]), ChallengeScope::Register)
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        auth.cleanup();
        assert_eq!(auth.stats().live_challenges, 0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_identity_locks() {
        let auth = authenticator(Duration::from_millis(1));
        for i in 0..50u8 {
            auth.get_challenge(NodeId::from_bytes([i; 32]), ChallengeScope::Register)
                .await;
        }
        assert_eq!(auth.stats().identity_locks, 50);

        // A lock someone is holding survives
        let held = NodeId::from_bytes([200; 32]);
        let guard = auth.lock(&held).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        auth.cleanup();
        let stats = auth.stats();
        assert_eq!(stats.live_challenges, 0);
        assert_eq!(stats.identity_locks, 1);

        drop(guard);
        auth.cleanup();
        assert_eq!(auth.stats().identity_locks, 0);
    }
}
