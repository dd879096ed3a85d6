//! Identity registration and device credentials
//!
//! A node proves possession of its identity key by signing a single-use
//! challenge. On success the gateway issues device credentials
//! (certificate + device key) which later authenticate the device to the
//! scheduler and the HSM relay. Every authenticated request is signed with
//! the device key. Launched node processes get credentials of their own
//! role for the node side of the relay.

pub mod authenticator;
pub mod certificate;
pub mod challenge;
pub mod store;
pub mod verifier;

pub use authenticator::{
    spawn_cleanup_task, AuthConfig, Authenticator, AuthenticatorStats, RecoverParams,
    RegisterParams,
};
pub use certificate::{
    request_message, CertificateIssuer, CertificateRole, CredentialBundle, DeviceCertificate,
    RequestProof, MAX_REQUEST_SKEW_SECS,
};
pub use challenge::{
    recovery_message, registration_message, ChallengeScope, RegistrationMetadata, CHALLENGE_LEN,
};
pub use store::{AuthenticatedNode, CredentialStore, CredentialStoreStats, Registration};
pub use verifier::{Ed25519Verifier, SignatureVerifier};
