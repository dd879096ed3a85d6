//! Relay messages and stream frames
//!
//! `raw` payloads are opaque signer messages. They are hex in JSON and are
//! never inspected by the relay.

use serde::{Deserialize, Serialize};

use crate::types::{hex_bytes, KeyholeError, NodeId};

/// Who is asking, and with which capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmRequestContext {
    pub node_id: NodeId,
    pub dbid: u64,
    pub capabilities: u64,
}

/// A signing request as delivered to the signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmRequest {
    pub request_id: u32,
    pub context: HsmRequestContext,
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
}

/// The signer's answer to exactly one [`HsmRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmResponse {
    pub request_id: u32,
    #[serde(with = "hex_bytes")]
    pub raw: Vec<u8>,
}

/// Frames sent by the hosted node on its stream.
/// `tag` is the node's own correlation value and is echoed back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeFrame {
    Request {
        tag: u64,
        dbid: u64,
        capabilities: u64,
        #[serde(with = "hex_bytes")]
        raw: Vec<u8>,
    },
    Grant {
        dbid: u64,
        capabilities: u64,
    },
}

/// Frames the relay sends to the hosted node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    Response {
        tag: u64,
        request_id: u32,
        #[serde(with = "hex_bytes")]
        raw: Vec<u8>,
    },
    Error {
        /// Absent for errors not tied to a request (e.g. a rejected grant)
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tag: Option<u64>,
        kind: String,
        message: String,
    },
}

impl RelayFrame {
    pub fn error(tag: Option<u64>, err: &KeyholeError) -> Self {
        Self::Error {
            tag,
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Frames exchanged with a signer session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignerFrame {
    Request(HsmRequest),
    Response(HsmResponse),
}
