//! Credential store
//!
//! Tracks, per node identity, the registration metadata, every device
//! certificate issued to it, and the certificate of its current node
//! process. Backed by a DashMap for concurrent reads with an optional JSON
//! snapshot on disk.
//!
//! ## Consistency
//!
//! Mutations are serialized by a write lock. Each one builds the new
//! registration, writes the snapshot that contains it, and only then
//! publishes it to the map. A failed write leaves both the map and the file
//! as they were.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::certificate::{
    CertificateIssuer, CertificateRole, CredentialBundle, DeviceCertificate, RequestProof,
};
use super::challenge::RegistrationMetadata;
use crate::types::{KeyholeError, NodeId, Result};

/// Snapshot file name inside the data directory
pub const SNAPSHOT_FILE: &str = "registrations.json";

/// A certificate issued to a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    pub serial: String,
    pub name: String,
    pub role: CertificateRole,
    pub issued_at: DateTime<Utc>,
}

impl From<&DeviceCertificate> for IssuedCertificate {
    fn from(cert: &DeviceCertificate) -> Self {
        Self {
            serial: cert.body.serial.clone(),
            name: cert.body.name.clone(),
            role: cert.body.role,
            issued_at: cert.body.issued_at,
        }
    }
}

/// Everything the gateway knows about a registered node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub node_id: NodeId,
    pub metadata: RegistrationMetadata,
    pub registered_at: DateTime<Utc>,
    /// Device certificates still valid for this node
    pub certificates: Vec<IssuedCertificate>,
    /// Certificate of the most recently launched node process
    #[serde(default)]
    pub node_certificate: Option<IssuedCertificate>,
}

impl Registration {
    fn holds(&self, role: CertificateRole, serial: &str) -> bool {
        match role {
            CertificateRole::Device => self.certificates.iter().any(|c| c.serial == serial),
            CertificateRole::Node => self
                .node_certificate
                .as_ref()
                .map_or(false, |c| c.serial == serial),
        }
    }
}

/// Proof that a caller presented a valid certificate for `node_id` and
/// signed the request with its key. Only the credential store can
/// construct one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedNode {
    node_id: NodeId,
    serial: String,
    role: CertificateRole,
}

impl AuthenticatedNode {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn role(&self) -> CertificateRole {
        self.role
    }

    #[cfg(test)]
    pub(crate) fn for_tests(node_id: NodeId) -> Self {
        Self {
            node_id,
            serial: "test-serial".to_string(),
            role: CertificateRole::Device,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    registrations: Vec<Registration>,
}

/// Credential store statistics
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStoreStats {
    pub registered_nodes: usize,
    pub issued_certificates: usize,
}

/// Per-identity registration metadata and issued credentials
pub struct CredentialStore {
    registrations: DashMap<NodeId, Registration>,
    issuer: CertificateIssuer,
    snapshot_path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    /// Memory-only store
    pub fn in_memory(issuer: CertificateIssuer) -> Self {
        Self {
            registrations: DashMap::new(),
            issuer,
            snapshot_path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Store persisted under `data_dir`, loading any existing snapshot
    pub async fn open(issuer: CertificateIssuer, data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(SNAPSHOT_FILE);
        let store = Self {
            registrations: DashMap::new(),
            issuer,
            snapshot_path: Some(path.clone()),
            write_lock: Mutex::new(()),
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    KeyholeError::Config(format!("corrupt snapshot {}: {}", path.display(), e))
                })?;
                let count = snapshot.registrations.len();
                for registration in snapshot.registrations {
                    store
                        .registrations
                        .insert(registration.node_id, registration);
                }
                info!("Loaded {} registrations from {}", count, path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No registration snapshot at {}", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(store)
    }

    pub fn issuer(&self) -> &CertificateIssuer {
        &self.issuer
    }

    pub fn is_registered(&self, node_id: &NodeId) -> bool {
        self.registrations.contains_key(node_id)
    }

    pub fn registration(&self, node_id: &NodeId) -> Option<Registration> {
        self.registrations.get(node_id).map(|r| r.clone())
    }

    /// Create or overwrite the registration of `node_id`. Device
    /// certificates issued by an earlier registration are revoked; the
    /// running node process keeps its certificate.
    pub async fn record_registration(
        &self,
        node_id: NodeId,
        metadata: RegistrationMetadata,
        certificate: &DeviceCertificate,
    ) -> Result<()> {
        let previous = self
            .commit(&node_id, |current| {
                Ok(Registration {
                    node_id,
                    metadata,
                    registered_at: Utc::now(),
                    certificates: vec![IssuedCertificate::from(certificate)],
                    node_certificate: current.and_then(|r| r.node_certificate),
                })
            })
            .await?;
        if previous.is_some() {
            info!(node_id = %node_id, "Registration overwritten, previous certificates revoked");
        }
        Ok(())
    }

    /// Add a recovered certificate to an existing registration
    pub async fn record_recovery(
        &self,
        node_id: &NodeId,
        certificate: &DeviceCertificate,
    ) -> Result<()> {
        self.commit(node_id, |current| {
            let mut registration = current.ok_or(KeyholeError::UnknownIdentity(*node_id))?;
            registration
                .certificates
                .push(IssuedCertificate::from(certificate));
            Ok(registration)
        })
        .await?;
        Ok(())
    }

    /// Mint the credentials a launched node process authenticates with.
    /// The previous node certificate of the identity is revoked.
    pub async fn issue_node_credential(&self, node_id: &NodeId) -> Result<CredentialBundle> {
        let (certificate, bundle) = self.issuer.issue(*node_id, CertificateRole::Node, "node")?;
        self.commit(node_id, |current| {
            let mut registration = current.ok_or(KeyholeError::UnknownIdentity(*node_id))?;
            registration.node_certificate = Some(IssuedCertificate::from(&certificate));
            Ok(registration)
        })
        .await?;
        info!(node_id = %node_id, serial = %certificate.serial(), "Issued node credential");
        Ok(bundle)
    }

    /// Validate a presented certificate and the caller's signature over
    /// the request it came with
    pub fn authenticate(
        &self,
        certificate: &DeviceCertificate,
        method: &str,
        path: &str,
        proof: &RequestProof,
    ) -> Result<AuthenticatedNode> {
        self.issuer.verify(certificate)?;
        certificate.verify_request(method, path, proof, Utc::now().timestamp())?;

        let node_id = *certificate.node_id();
        let registration = self.registrations.get(&node_id).ok_or_else(|| {
            KeyholeError::Unauthenticated(format!("node {} is not registered", node_id))
        })?;

        let role = certificate.role();
        if !registration.holds(role, certificate.serial()) {
            warn!(
                node_id = %node_id,
                serial = %certificate.serial(),
                %role,
                "Certificate not current for node"
            );
            return Err(KeyholeError::Unauthenticated(
                "certificate is not current for this node".into(),
            ));
        }

        Ok(AuthenticatedNode {
            node_id,
            serial: certificate.body.serial.clone(),
            role,
        })
    }

    pub fn stats(&self) -> CredentialStoreStats {
        CredentialStoreStats {
            registered_nodes: self.registrations.len(),
            issued_certificates: self
                .registrations
                .iter()
                .map(|r| r.certificates.len() + usize::from(r.node_certificate.is_some()))
                .sum(),
        }
    }

    /// Replace the registration of `node_id` with what `change` builds from
    /// the current one. The snapshot is written before the map is touched.
    async fn commit<F>(&self, node_id: &NodeId, change: F) -> Result<Option<Registration>>
    where
        F: FnOnce(Option<Registration>) -> Result<Registration>,
    {
        let _guard = self.write_lock.lock().await;
        let candidate = change(self.registration(node_id))?;

        if let Some(ref path) = self.snapshot_path {
            let mut registrations: Vec<Registration> = self
                .registrations
                .iter()
                .filter(|r| r.key() != node_id)
                .map(|r| r.value().clone())
                .collect();
            registrations.push(candidate.clone());
            write_snapshot(path, &Snapshot { registrations }).await?;
        }

        Ok(self.registrations.insert(*node_id, candidate))
    }
}

/// Write the snapshot atomically (temp file + rename)
async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| KeyholeError::Internal(format!("snapshot encode failed: {}", e)))?;

    let tmp = path.with_extension("json.tmp");
    if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
        warn!("Failed to write snapshot {}: {}", tmp.display(), e);
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        warn!("Failed to replace snapshot {}: {}", path.display(), e);
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!(
        "Persisted {} registrations to {}",
        snapshot.registrations.len(),
        path.display()
    );
    Ok(())
}
