//! Shared types: node identity, errors and serde helpers

pub mod error;
pub mod node_id;

pub use error::{ErrorBody, KeyholeError, Result};
pub use node_id::{NodeId, NODE_ID_LEN};

/// Serde helper encoding `Vec<u8>` fields as lowercase hex strings
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
