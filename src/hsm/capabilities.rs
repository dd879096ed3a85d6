//! Signing capabilities per (node, dbid)
//!
//! The bits mirror the hsmd permission flags. dbid 0 is the node's own
//! context and holds every capability; the node hands narrower grants to
//! further dbids (peers, channels) over its stream.

use bitflags::bitflags;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::types::{KeyholeError, NodeId, Result};

/// dbid of the node's own signing context
pub const MASTER_DBID: u64 = 0;

bitflags! {
    /// Signing operation classes a dbid may request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u64 {
        const ECDH = 1;
        const SIGN_GOSSIP = 2;
        const SIGN_ONCHAIN_TX = 4;
        const COMMITMENT_POINT = 8;
        const SIGN_REMOTE_TX = 16;
        const SIGN_CLOSING_TX = 32;
        const SIGN_WILL_FUND_OFFER = 64;
        const MASTER = 1024;
    }
}

/// Capabilities granted per (node, dbid)
#[derive(Default)]
pub struct CapabilityGrants {
    grants: DashMap<(NodeId, u64), Capabilities>,
}

impl CapabilityGrants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give the node's master context every capability
    pub fn open_node(&self, node_id: &NodeId) {
        self.grants
            .insert((*node_id, MASTER_DBID), Capabilities::all());
    }

    pub fn get(&self, node_id: &NodeId, dbid: u64) -> Option<Capabilities> {
        self.grants.get(&(*node_id, dbid)).map(|c| *c)
    }

    /// Record capabilities for a client dbid, on behalf of the node
    pub fn grant(&self, node_id: &NodeId, dbid: u64, requested: u64) -> Result<()> {
        let master = self.get(node_id, MASTER_DBID).unwrap_or_else(Capabilities::empty);
        let caps = Capabilities::from_bits_retain(requested);

        let allowed = dbid != MASTER_DBID
            && master.contains(Capabilities::MASTER)
            && !caps.contains(Capabilities::MASTER)
            && master.contains(caps);

        if !allowed {
            warn!(
                node_id = %node_id,
                dbid,
                requested,
                "Rejected capability grant"
            );
            return Err(KeyholeError::CapabilityViolation {
                dbid,
                requested,
                granted: master.bits(),
            });
        }

        info!(node_id = %node_id, dbid, caps = ?caps, "Granted client capabilities");
        self.grants.insert((*node_id, dbid), caps);
        Ok(())
    }

    /// Fail closed unless `requested` is a subset of the grant for `dbid`
    pub fn check(&self, node_id: &NodeId, dbid: u64, requested: u64) -> Result<Capabilities> {
        let granted = self.get(node_id, dbid);
        let requested_caps = Capabilities::from_bits_retain(requested);

        match granted {
            Some(granted) if granted.contains(requested_caps) => Ok(requested_caps),
            other => {
                let granted = other.map(|c| c.bits()).unwrap_or(0);
                warn!(
                    node_id = %node_id,
                    dbid,
                    requested,
                    granted,
                    "Capability violation"
                );
                Err(KeyholeError::CapabilityViolation {
                    dbid,
                    requested,
                    granted,
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
