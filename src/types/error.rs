//! Error types for Keyhole
//!
//! One enum for the whole gateway. Protocol failures (authentication,
//! capability, relay outcomes) are distinct variants so callers can match on
//! them; infrastructure failures carry a message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::NodeId;

/// Main error type for Keyhole operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyholeError {
    /// Missing, expired or mismatched challenge, or an invalid signature
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The presented challenge was already consumed
    #[error("Challenge has already been used")]
    Replay,

    /// Recover (or any registered-only call) on an identity never registered
    #[error("Unknown identity: {0}")]
    UnknownIdentity(NodeId),

    /// Caller did not present a valid device credential for the identity
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Node process failed or timed out while starting
    #[error("Scheduling failed: {0}")]
    Scheduling(String),

    /// No signer response arrived before the request deadline
    #[error("Request {0} timed out waiting for the signer")]
    RequestTimeout(u32),

    /// The stream owning the request ended before it was answered
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// A response referenced a request that is no longer pending
    #[error("Duplicate or unknown response for request {0}")]
    DuplicateResponse(u32),

    /// Requested capabilities exceed what was granted for the dbid
    #[error("Capability violation for dbid {dbid}: requested {requested:#x}, granted {granted:#x}")]
    CapabilityViolation {
        dbid: u64,
        requested: u64,
        granted: u64,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeyholeError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Replay => StatusCode::UNAUTHORIZED,
            Self::UnknownIdentity(_) => StatusCode::NOT_FOUND,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Scheduling(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RequestTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ConnectionLost(_) => StatusCode::BAD_GATEWAY,
            Self::DuplicateResponse(_) => StatusCode::CONFLICT,
            Self::CapabilityViolation { .. } => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::Replay => "replay",
            Self::UnknownIdentity(_) => "unknown_identity",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Scheduling(_) => "scheduling",
            Self::RequestTimeout(_) => "request_timeout",
            Self::ConnectionLost(_) => "connection_lost",
            Self::DuplicateResponse(_) => "duplicate_response",
            Self::CapabilityViolation { .. } => "capability_violation",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

/// JSON body returned for failed HTTP calls
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl From<&KeyholeError> for ErrorBody {
    fn from(err: &KeyholeError) -> Self {
        Self {
            error: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for KeyholeError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from(&self);
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<std::io::Error> for KeyholeError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for KeyholeError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hex::FromHexError> for KeyholeError {
    fn from(err: hex::FromHexError) -> Self {
        Self::BadRequest(format!("Hex error: {}", err))
    }
}

/// Result type alias for Keyhole operations
pub type Result<T> = std::result::Result<T, KeyholeError>;
