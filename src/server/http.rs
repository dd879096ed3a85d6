//! HTTP server: scheduler API, health, and WebSocket routes
//!
//! Bytes travel as lowercase hex in JSON bodies. Authenticated calls carry
//! three headers:
//!
//! - `x-device-cert`: hex of the certificate JSON, i.e. the `device_cert`
//!   field returned by register and recover
//! - `x-device-timestamp`: unix seconds when the request was signed
//! - `x-device-signature`: hex ed25519 signature by the certificate's key
//!   over [`request_message`](crate::auth::request_message)
//!
//! The scheduler and `/v1/hsm/signer` take device certificates;
//! `/v1/hsm/node` takes only the certificate handed to a launched node.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::websocket;
use crate::auth::{
    AuthenticatedNode, Authenticator, AuthenticatorStats, CertificateRole, ChallengeScope,
    CredentialBundle, CredentialStoreStats, DeviceCertificate, RecoverParams, RegisterParams,
    RegistrationMetadata, RequestProof,
};
use crate::hsm::{HsmRelay, RelayStats};
use crate::scheduler::{ScheduleAssignment, Scheduler, SchedulerStats};
use crate::types::{hex_bytes, KeyholeError, NodeId, Result};

/// Header carrying the hex-encoded certificate
pub const DEVICE_CERT_HEADER: &str = "x-device-cert";
/// Header carrying the signing time of the request
pub const DEVICE_TIMESTAMP_HEADER: &str = "x-device-timestamp";
/// Header carrying the request signature
pub const DEVICE_SIGNATURE_HEADER: &str = "x-device-signature";

/// Shared server state
pub struct AppState {
    pub authenticator: Arc<Authenticator>,
    pub scheduler: Scheduler,
    pub relay: HsmRelay,
    pub dev_mode: bool,
}

impl AppState {
    pub fn new(authenticator: Arc<Authenticator>, scheduler: Scheduler, relay: HsmRelay) -> Self {
        Self {
            authenticator,
            scheduler,
            relay,
            dev_mode: false,
        }
    }

    /// Authenticate the caller of `parts`, requiring a certificate of `role`
    fn authenticate(&self, parts: &Parts, role: CertificateRole) -> Result<AuthenticatedNode> {
        let certificate = DeviceCertificate::from_header_value(header(parts, DEVICE_CERT_HEADER)?)?;
        let proof = RequestProof::from_header_values(
            header(parts, DEVICE_TIMESTAMP_HEADER)?,
            header(parts, DEVICE_SIGNATURE_HEADER)?,
        )?;

        let caller = self.authenticator.store().authenticate(
            &certificate,
            parts.method.as_str(),
            parts.uri.path(),
            &proof,
        )?;
        if caller.role() != role {
            return Err(KeyholeError::Unauthenticated(format!(
                "{} certificate presented where a {} certificate is required",
                caller.role(),
                role
            )));
        }
        Ok(caller)
    }

    fn authenticate_logged(
        &self,
        parts: &Parts,
        role: CertificateRole,
    ) -> Result<AuthenticatedNode> {
        self.authenticate(parts, role).map_err(|e| {
            warn!("Rejected {} credential on {}: {}", role, parts.uri.path(), e);
            e
        })
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Result<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| KeyholeError::Unauthenticated(format!("missing {} header", name)))
}

/// Extractor for a caller holding a valid device certificate
pub struct DeviceAuth(pub AuthenticatedNode);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for DeviceAuth {
    type Rejection = KeyholeError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        state
            .authenticate_logged(parts, CertificateRole::Device)
            .map(DeviceAuth)
    }
}

/// Extractor for a launched node process
pub struct NodeAuth(pub AuthenticatedNode);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for NodeAuth {
    type Rejection = KeyholeError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        state
            .authenticate_logged(parts, CertificateRole::Node)
            .map(NodeAuth)
    }
}

// === Request / response bodies ===

#[derive(Debug, Deserialize)]
pub struct ChallengeRequest {
    pub scope: ChallengeScope,
    pub node_id: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    #[serde(with = "hex_bytes")]
    pub challenge: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct RegistrationRequest {
    pub node_id: NodeId,
    #[serde(flatten)]
    pub metadata: RegistrationMetadata,
    #[serde(with = "hex_bytes")]
    pub challenge: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub struct RecoveryRequest {
    pub node_id: NodeId,
    #[serde(with = "hex_bytes")]
    pub challenge: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

/// Body of both the registration and the recovery response
pub type CredentialResponse = CredentialBundle;

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Deserialize)]
pub struct NodeInfoRequest {
    pub node_id: NodeId,
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeInfoResponse {
    pub node_id: NodeId,
    pub endpoint: String,
}

impl From<ScheduleAssignment> for NodeInfoResponse {
    fn from(assignment: ScheduleAssignment) -> Self {
        Self {
            node_id: assignment.node_id,
            endpoint: assignment.endpoint,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub auth: AuthenticatorStats,
    pub credentials: CredentialStoreStats,
    pub scheduler: SchedulerStats,
    pub relay: RelayStats,
}

// === Handlers ===

/// POST /v1/scheduler/challenge
async fn get_challenge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChallengeRequest>,
) -> Json<ChallengeResponse> {
    let challenge = state
        .authenticator
        .get_challenge(req.node_id, req.scope)
        .await;
    Json(ChallengeResponse {
        challenge: challenge.to_vec(),
    })
}

/// POST /v1/scheduler/register
async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegistrationRequest>,
) -> Result<Json<CredentialResponse>> {
    let bundle = state
        .authenticator
        .register(RegisterParams {
            node_id: req.node_id,
            metadata: req.metadata,
            challenge: req.challenge,
            signature: req.signature,
        })
        .await?;
    Ok(Json(bundle))
}

/// POST /v1/scheduler/recover
async fn recover(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecoveryRequest>,
) -> Result<Json<CredentialResponse>> {
    let bundle = state
        .authenticator
        .recover(RecoverParams {
            node_id: req.node_id,
            challenge: req.challenge,
            signature: req.signature,
        })
        .await?;
    Ok(Json(bundle))
}

/// POST /v1/scheduler/schedule
async fn schedule(
    State(state): State<Arc<AppState>>,
    DeviceAuth(caller): DeviceAuth,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<NodeInfoResponse>> {
    let assignment = state.scheduler.schedule(&caller, &req.node_id).await?;
    Ok(Json(assignment.into()))
}

/// POST /v1/scheduler/node-info
async fn node_info(
    State(state): State<Arc<AppState>>,
    DeviceAuth(caller): DeviceAuth,
    Json(req): Json<NodeInfoRequest>,
) -> Result<Json<NodeInfoResponse>> {
    state
        .scheduler
        .get_node_info(&caller, &req.node_id, req.wait)
        .await?
        .map(|assignment| Json(assignment.into()))
        .ok_or_else(|| KeyholeError::NotFound(format!("node {} is not scheduled", req.node_id)))
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        auth: state.authenticator.stats(),
        credentials: state.authenticator.store().stats(),
        scheduler: state.scheduler.stats(),
        relay: state.relay.stats(),
    })
}

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/scheduler/challenge", post(get_challenge))
        .route("/v1/scheduler/register", post(register))
        .route("/v1/scheduler/recover", post(recover))
        .route("/v1/scheduler/schedule", post(schedule))
        .route("/v1/scheduler/node-info", post(node_info))
        .route("/v1/hsm/node", get(websocket::node_stream))
        .route("/v1/hsm/signer", get(websocket::signer_stream))
        .with_state(state)
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>, listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!("Keyhole listening on {}", listen);

    if state.dev_mode {
        warn!("Development mode enabled - device certificates signed by an ephemeral CA");
    }

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Keyhole stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
