//! HSM request relay
//!
//! A hosted node holds no keys. Every signing operation it needs goes out
//! over its node stream, is authorized against the capabilities of its
//! dbid, waits in the pending-request table, and is answered by the remote
//! signer attached for the same identity.

pub mod capabilities;
pub mod messages;
pub mod pending;
pub mod relay;

pub use capabilities::{Capabilities, CapabilityGrants, MASTER_DBID};
pub use messages::{
    HsmRequest, HsmRequestContext, HsmResponse, NodeFrame, RelayFrame, SignerFrame,
};
pub use pending::{PendingTable, SessionId, StreamId};
pub use relay::{
    spawn_sweep_task, HsmRelay, NodeStream, PendingRequest, RelayConfig, RelayStats,
    SignerSession,
};
