//! Assignment registry: node identity to running node endpoint
//!
//! Each identity owns a `watch` slot holding its current assignment (or
//! none). Long-poll readers subscribe to the slot and wake as soon as an
//! assignment is recorded; dropping the wait simply drops the receiver.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::NodeId;

/// A node process confirmed running for an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleAssignment {
    pub node_id: NodeId,
    /// Where the hosted node can be reached
    pub endpoint: String,
    /// Distinguishes successive processes for the same identity
    pub instance_id: Uuid,
    pub started_at: DateTime<Utc>,
}

type Slot = watch::Sender<Option<ScheduleAssignment>>;

/// Registry of identity → assignment
#[derive(Default)]
pub struct AssignmentRegistry {
    slots: DashMap<NodeId, Slot>,
}

impl AssignmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current assignment, if any
    pub fn get(&self, node_id: &NodeId) -> Option<ScheduleAssignment> {
        self.slots.get(node_id).and_then(|slot| slot.borrow().clone())
    }

    /// Record an assignment, waking any waiters
    pub fn record(&self, assignment: ScheduleAssignment) {
        info!(
            node_id = %assignment.node_id,
            endpoint = %assignment.endpoint,
            instance = %assignment.instance_id,
            "Recorded node assignment"
        );
        self.slots
            .entry(assignment.node_id)
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(assignment));
    }

    /// Clear the assignment if it still belongs to `instance_id`
    pub fn clear(&self, node_id: &NodeId, instance_id: Uuid) -> bool {
        let Some(slot) = self.slots.get(node_id) else {
            return false;
        };
        let cleared = slot.send_if_modified(|current| match current {
            Some(a) if a.instance_id == instance_id => {
                *current = None;
                true
            }
            _ => false,
        });
        if cleared {
            info!(node_id = %node_id, instance = %instance_id, "Cleared node assignment");
        }
        cleared
    }

    /// Wait up to `max_wait` for an assignment to exist
    pub async fn wait(&self, node_id: &NodeId, max_wait: Duration) -> Option<ScheduleAssignment> {
        let mut rx = self
            .slots
            .entry(*node_id)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();

        let outcome = match tokio::time::timeout(max_wait, rx.wait_for(|a| a.is_some())).await {
            Ok(Ok(assignment)) => (*assignment).clone(),
            Ok(Err(_)) => None,
            Err(_) => {
                debug!(node_id = %node_id, "Node info wait elapsed without assignment");
                None
            }
        };
        outcome
    }

    pub fn list(&self) -> Vec<ScheduleAssignment> {
        self.slots
            .iter()
            .filter_map(|slot| slot.borrow().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.borrow().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
