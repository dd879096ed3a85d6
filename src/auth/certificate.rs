//! Device credential issuance
//!
//! The gateway holds an ed25519 issuer key. Every successful Register or
//! Recover mints a fresh device keypair and a certificate binding the
//! device public key to the node identity, signed by the issuer. Each
//! launched node process gets a certificate of its own with the
//! [`CertificateRole::Node`] role.
//!
//! - `deviceCert` is the JSON encoding of [`DeviceCertificate`]
//! - `deviceKey` is the raw 32-byte device secret, zeroized on drop
//!
//! A certificate alone does not authenticate. Every request also carries a
//! [`RequestProof`]: a signature by the certificate's key over the request
//! method, path and a recent timestamp.

use std::path::Path;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, SIGNATURE_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{KeyholeError, NodeId, Result};

const REQUEST_DOMAIN: &[u8] = b"keyhole/request/v1";

/// How far a request timestamp may be from the gateway clock, in seconds
pub const MAX_REQUEST_SKEW_SECS: i64 = 300;

/// Who a certificate speaks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateRole {
    /// A user device: schedules the node and runs its signer
    Device,
    /// The hosted node process itself: opens the HSM request stream
    Node,
}

impl std::fmt::Display for CertificateRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device => f.write_str("device"),
            Self::Node => f.write_str("node"),
        }
    }
}

/// Digest a credential holder signs to authenticate one request
pub fn request_message(timestamp: i64, method: &str, path: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(REQUEST_DOMAIN);
    hasher.update(timestamp.to_be_bytes());
    hasher.update((method.len() as u32).to_be_bytes());
    hasher.update(method.as_bytes());
    hasher.update((path.len() as u32).to_be_bytes());
    hasher.update(path.as_bytes());
    hasher.finalize().into()
}

/// Proof of possession of a certificate's key for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestProof {
    /// Unix seconds at signing time
    pub timestamp: i64,
    pub signature: Vec<u8>,
}

impl RequestProof {
    /// Parse the timestamp and hex signature headers
    pub fn from_header_values(timestamp: &str, signature: &str) -> Result<Self> {
        let timestamp = timestamp.trim().parse::<i64>().map_err(|e| {
            KeyholeError::Unauthenticated(format!("malformed request timestamp: {}", e))
        })?;
        let signature = hex::decode(signature.trim()).map_err(|e| {
            KeyholeError::Unauthenticated(format!("malformed request signature: {}", e))
        })?;
        Ok(Self {
            timestamp,
            signature,
        })
    }

    pub fn signature_hex(&self) -> String {
        hex::encode(&self.signature)
    }
}

/// The signed part of a device certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBody {
    /// Unique serial, recorded against the node in the credential store
    pub serial: String,
    pub node_id: NodeId,
    /// Key the holder signs requests with
    #[serde(with = "crate::types::hex_bytes")]
    pub device_public_key: Vec<u8>,
    pub role: CertificateRole,
    /// Holder name, e.g. "device", "node" or "recovered-1a2b3c4d5e6f7a8b"
    pub name: String,
    pub issued_at: DateTime<Utc>,
    /// Hex public key of the issuer
    pub issuer: String,
}

/// A device certificate presented by callers to authenticate as a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCertificate {
    #[serde(flatten)]
    pub body: CertificateBody,
    #[serde(with = "crate::types::hex_bytes")]
    pub signature: Vec<u8>,
}

impl DeviceCertificate {
    pub fn node_id(&self) -> &NodeId {
        &self.body.node_id
    }

    pub fn serial(&self) -> &str {
        &self.body.serial
    }

    pub fn role(&self) -> CertificateRole {
        self.body.role
    }

    /// Check that `proof` was made with this certificate's key for the
    /// given request, at a time close to `now` (unix seconds)
    pub fn verify_request(
        &self,
        method: &str,
        path: &str,
        proof: &RequestProof,
        now: i64,
    ) -> Result<()> {
        if now.abs_diff(proof.timestamp) > MAX_REQUEST_SKEW_SECS as u64 {
            return Err(KeyholeError::Unauthenticated(
                "request timestamp outside the accepted window".into(),
            ));
        }
        let key_bytes: &[u8; 32] =
            self.body.device_public_key.as_slice().try_into().map_err(|_| {
                KeyholeError::Unauthenticated("certificate key has wrong length".into())
            })?;
        let key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|_| KeyholeError::Unauthenticated("certificate key is invalid".into()))?;
        let sig_bytes: &[u8; SIGNATURE_LENGTH] =
            proof.signature.as_slice().try_into().map_err(|_| {
                KeyholeError::Unauthenticated("request signature has wrong length".into())
            })?;
        key.verify_strict(
            &request_message(proof.timestamp, method, path),
            &Signature::from_bytes(sig_bytes),
        )
        .map_err(|_| KeyholeError::Unauthenticated("request signature invalid".into()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| KeyholeError::Unauthenticated(format!("malformed certificate: {}", e)))
    }

    /// Hex form used in the `x-device-cert` header
    pub fn to_header_value(&self) -> Result<String> {
        Ok(hex::encode(self.to_bytes()?))
    }

    pub fn from_header_value(value: &str) -> Result<Self> {
        let bytes = hex::decode(value.trim())
            .map_err(|e| KeyholeError::Unauthenticated(format!("malformed certificate: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

/// Credentials handed to a device after Register or Recover, or to a node
/// process at launch
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct CredentialBundle {
    #[zeroize(skip)]
    #[serde(with = "crate::types::hex_bytes")]
    pub device_cert: Vec<u8>,
    #[serde(with = "crate::types::hex_bytes")]
    pub device_key: Vec<u8>,
}

impl CredentialBundle {
    pub fn certificate(&self) -> Result<DeviceCertificate> {
        DeviceCertificate::from_bytes(&self.device_cert)
    }

    pub fn is_empty(&self) -> bool {
        self.device_cert.is_empty() || self.device_key.is_empty()
    }

    /// Sign a request with the device key
    pub fn sign_request(&self, method: &str, path: &str, timestamp: i64) -> Result<RequestProof> {
        let mut seed: [u8; 32] = self.device_key.as_slice().try_into().map_err(|_| {
            KeyholeError::Internal(format!(
                "device key must be 32 bytes, got {}",
                self.device_key.len()
            ))
        })?;
        let key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        let signature = key.sign(&request_message(timestamp, method, path));
        Ok(RequestProof {
            timestamp,
            signature: signature.to_bytes().to_vec(),
        })
    }
}

impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("device_cert_len", &self.device_cert.len())
            .field("device_key", &"<redacted>")
            .finish()
    }
}

/// Signs device certificates
pub struct CertificateIssuer {
    signing_key: SigningKey,
}

impl CertificateIssuer {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Fresh random issuer key (development only)
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    /// Load from a hex-encoded 32-byte seed
    pub fn from_hex_seed(seed: &str) -> Result<Self> {
        let mut bytes = hex::decode(seed.trim())
            .map_err(|e| KeyholeError::Config(format!("invalid issuer key: {}", e)))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            KeyholeError::Config(format!("issuer key must be 32 bytes, got {}", bytes.len()))
        })?;
        bytes.zeroize();
        Ok(Self::new(SigningKey::from_bytes(&seed)))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let mut contents = std::fs::read_to_string(path).map_err(|e| {
            KeyholeError::Config(format!("cannot read issuer key {}: {}", path.display(), e))
        })?;
        let issuer = Self::from_hex_seed(&contents);
        contents.zeroize();
        issuer
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn issuer_id(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    /// Mint a keypair and certificate for `node_id`
    pub fn issue(
        &self,
        node_id: NodeId,
        role: CertificateRole,
        name: impl Into<String>,
    ) -> Result<(DeviceCertificate, CredentialBundle)> {
        let device_key = SigningKey::generate(&mut OsRng);
        let body = CertificateBody {
            serial: uuid::Uuid::new_v4().to_string(),
            node_id,
            device_public_key: device_key.verifying_key().to_bytes().to_vec(),
            role,
            name: name.into(),
            issued_at: Utc::now(),
            issuer: self.issuer_id(),
        };
        let signature = self.signing_key.sign(&serde_json::to_vec(&body)?);
        let certificate = DeviceCertificate {
            body,
            signature: signature.to_bytes().to_vec(),
        };

        let bundle = CredentialBundle {
            device_cert: certificate.to_bytes()?,
            device_key: device_key.to_bytes().to_vec(),
        };
        Ok((certificate, bundle))
    }

    /// Check that `certificate` was signed by this issuer
    pub fn verify(&self, certificate: &DeviceCertificate) -> Result<()> {
        if certificate.body.issuer != self.issuer_id() {
            return Err(KeyholeError::Unauthenticated(
                "certificate was issued by another authority".into(),
            ));
        }
        let sig_bytes: &[u8; SIGNATURE_LENGTH] =
            certificate.signature.as_slice().try_into().map_err(|_| {
                KeyholeError::Unauthenticated("certificate signature has wrong length".into())
            })?;
        let message = serde_json::to_vec(&certificate.body)?;
        self.verifying_key()
            .verify_strict(&message, &Signature::from_bytes(sig_bytes))
            .map_err(|_| KeyholeError::Unauthenticated("certificate signature invalid".into()))
    }
}
