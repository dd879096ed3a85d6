//! Pending-request table
//!
//! Every request in flight between a node stream and its signers has one
//! entry here, keyed by its request id. An entry leaves the table exactly
//! once: through a response, its deadline, the loss of its node stream or of
//! the last signer it was delivered to, or its caller giving up. Removal and
//! resolution happen in one step (`remove_if` then send), so no caller is
//! resolved twice.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::messages::HsmRequestContext;
use crate::types::{KeyholeError, NodeId, Result};

/// Identifies one node stream
pub type StreamId = u64;
/// Identifies one signer session
pub type SessionId = u64;

type Completion = oneshot::Sender<Result<Vec<u8>>>;

struct PendingEntry {
    context: HsmRequestContext,
    issued_at: Instant,
    deadline: Instant,
    stream: StreamId,
    /// Whether any signer session has received the request
    delivered: bool,
    completion: Completion,
}

impl PendingEntry {
    fn resolve(self, request_id: u32, outcome: Result<Vec<u8>>) {
        if self.completion.send(outcome).is_err() {
            debug!(request_id, "Caller went away before resolution");
        }
    }
}

/// A freshly registered request
pub struct Registered {
    pub request_id: u32,
    pub deadline: Instant,
    pub completion: oneshot::Receiver<Result<Vec<u8>>>,
}

/// Concurrent request id → waiting caller map
pub struct PendingTable {
    entries: DashMap<u32, PendingEntry>,
    next_id: AtomicU32,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an undelivered request under a fresh id. Ids still pending
    /// are skipped.
    pub fn register(
        &self,
        context: HsmRequestContext,
        stream: StreamId,
        deadline: Instant,
    ) -> Registered {
        let (completion, rx) = oneshot::channel();
        loop {
            let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.entries.entry(request_id) {
                slot.insert(PendingEntry {
                    context,
                    issued_at: Instant::now(),
                    deadline,
                    stream,
                    delivered: false,
                    completion,
                });
                return Registered {
                    request_id,
                    deadline,
                    completion: rx,
                };
            }
        }
    }

    /// Note that a signer session received the request.
    /// Returns false if the entry is gone.
    pub fn mark_delivered(&self, request_id: u32) -> bool {
        match self.entries.get_mut(&request_id) {
            Some(mut entry) => {
                entry.delivered = true;
                true
            }
            None => false,
        }
    }

    /// True while the request is pending and no signer has received it
    pub fn awaiting_delivery(&self, request_id: u32) -> bool {
        self.entries
            .get(&request_id)
            .map(|entry| !entry.delivered)
            .unwrap_or(false)
    }

    /// Resolve a request with a signer's answer. Any signer session of the
    /// request's node may answer; the first answer wins.
    pub fn complete(&self, node_id: &NodeId, request_id: u32, raw: Vec<u8>) -> Result<()> {
        let removed = self
            .entries
            .remove_if(&request_id, |_, entry| entry.context.node_id == *node_id);
        match removed {
            Some((_, entry)) => {
                debug!(
                    request_id,
                    dbid = entry.context.dbid,
                    elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
                    len = raw.len(),
                    "Signer answered request"
                );
                entry.resolve(request_id, Ok(raw));
                Ok(())
            }
            None => {
                debug!(request_id, "Discarding duplicate or unknown signer response");
                Err(KeyholeError::DuplicateResponse(request_id))
            }
        }
    }

    /// Resolve the request as timed out. Returns false if it already left.
    pub fn expire(&self, request_id: u32) -> bool {
        match self.entries.remove(&request_id) {
            Some((_, entry)) => {
                warn!(request_id, dbid = entry.context.dbid, "Request timed out");
                entry.resolve(request_id, Err(KeyholeError::RequestTimeout(request_id)));
                true
            }
            None => false,
        }
    }

    /// Drop the entry of a caller that stopped waiting
    pub fn cancel(&self, request_id: u32) {
        if self.entries.remove(&request_id).is_some() {
            debug!(request_id, "Request abandoned by caller");
        }
    }

    /// Fail every request issued on a node stream
    pub fn fail_stream(&self, stream: StreamId) -> usize {
        self.fail_where(
            |entry| entry.stream == stream,
            "node stream closed",
        )
    }

    /// Fail every request of `node_id` that a signer already received.
    /// Used when the node's last signer session ends.
    pub fn fail_delivered(&self, node_id: &NodeId) -> usize {
        self.fail_where(
            |entry| entry.delivered && entry.context.node_id == *node_id,
            "signer session ended",
        )
    }

    /// Time out every entry past its deadline
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| *e.key())
            .collect();

        let mut count = 0;
        for request_id in expired {
            if let Some((_, entry)) = self
                .entries
                .remove_if(&request_id, |_, e| e.deadline <= now)
            {
                warn!(request_id, dbid = entry.context.dbid, "Request swept after deadline");
                entry.resolve(request_id, Err(KeyholeError::RequestTimeout(request_id)));
                count += 1;
            }
        }
        count
    }

    fn fail_where(&self, owned: impl Fn(&PendingEntry) -> bool, reason: &str) -> usize {
        let ids: Vec<u32> = self
            .entries
            .iter()
            .filter(|e| owned(e.value()))
            .map(|e| *e.key())
            .collect();

        let mut count = 0;
        for request_id in ids {
            if let Some((_, entry)) = self.entries.remove_if(&request_id, |_, e| owned(e)) {
                entry.resolve(
                    request_id,
                    Err(KeyholeError::ConnectionLost(reason.to_string())),
                );
                count += 1;
            }
        }
        if count > 0 {
            warn!(count, reason, "Failed pending requests");
        }
        count
    }

    pub fn contains(&self, request_id: u32) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context(node: u8, dbid: u64) -> HsmRequestContext {
        HsmRequestContext {
            node_id: NodeId::from_bytes([node; 32]),
            dbid,
            capabilities: 0,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_complete_resolves_once() {
        let table = PendingTable::new();
        let node = NodeId::from_bytes([1; 32]);
        let reg = table.register(context(1, 0), 1, deadline());

        table.complete(&node, reg.request_id, vec![1, 2]).unwrap();
        assert_eq!(reg.completion.await.unwrap(), Ok(vec![1, 2]));

        assert_eq!(
            table.complete(&node, reg.request_id, vec![3]),
            Err(KeyholeError::DuplicateResponse(reg.request_id))
        );
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_other_node_cannot_answer() {
        let table = PendingTable::new();
        let reg = table.register(context(1, 0), 1, deadline());

        assert!(table
            .complete(&NodeId::from_bytes([2; 32]), reg.request_id, vec![])
            .is_err());
        assert!(table.contains(reg.request_id));
    }

    #[tokio::test]
    async fn test_response_after_timeout_is_duplicate() {
        let table = PendingTable::new();
        let node = NodeId::from_bytes([1; 32]);
        let reg = table.register(context(1, 0), 1, deadline());

        assert!(table.expire(reg.request_id));
        assert_eq!(
            table.complete(&node, reg.request_id, vec![1]),
            Err(KeyholeError::DuplicateResponse(reg.request_id))
        );
        assert_eq!(
            reg.completion.await.unwrap(),
            Err(KeyholeError::RequestTimeout(reg.request_id))
        );
    }

    #[test]
    fn test_ids_are_unique_while_pending() {
        let table = PendingTable::new();
        let a = table.register(context(1, 0), 1, deadline());
        let b = table.register(context(1, 0), 1, deadline());
        assert_ne!(a.request_id, b.request_id);

        // Wrap the counter onto a live id; it must be skipped
        table.next_id.store(a.request_id, Ordering::Relaxed);
        let c = table.register(context(1, 0), 1, deadline());
        assert_ne!(c.request_id, a.request_id);
        assert_ne!(c.request_id, b.request_id);
    }

    #[test]
    fn test_delivery_tracking() {
        let table = PendingTable::new();
        let reg = table.register(context(1, 0), 1, deadline());
        assert!(table.awaiting_delivery(reg.request_id));

        assert!(table.mark_delivered(reg.request_id));
        assert!(!table.awaiting_delivery(reg.request_id));

        table.cancel(reg.request_id);
        assert!(!table.mark_delivered(reg.request_id));
        assert!(!table.awaiting_delivery(reg.request_id));
    }

    #[tokio::test]
    async fn test_fail_stream_and_delivered() {
        let table = PendingTable::new();
        let on_stream = table.register(context(1, 0), 1, deadline());
        let delivered = table.register(context(1, 1), 2, deadline());
        let undelivered = table.register(context(1, 2), 2, deadline());
        let other_node = table.register(context(2, 0), 3, deadline());
        table.mark_delivered(delivered.request_id);
        table.mark_delivered(other_node.request_id);

        assert_eq!(table.fail_stream(1), 1);
        assert_eq!(table.fail_delivered(&NodeId::from_bytes([1; 32])), 1);

        assert!(matches!(
            on_stream.completion.await.unwrap(),
            Err(KeyholeError::ConnectionLost(_))
        ));
        assert!(matches!(
            delivered.completion.await.unwrap(),
            Err(KeyholeError::ConnectionLost(_))
        ));
        assert!(table.contains(undelivered.request_id));
        assert!(table.contains(other_node.request_id));
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let table = PendingTable::new();
        let now = Instant::now();
        let stale = table.register(context(1, 0), 1, now);
        let fresh = table.register(context(1, 0), 1, deadline());

        assert_eq!(table.sweep_expired(now), 1);
        assert_eq!(
            stale.completion.await.unwrap(),
            Err(KeyholeError::RequestTimeout(stale.request_id))
        );
        assert!(table.contains(fresh.request_id));
        assert!(!table.expire(stale.request_id));
    }
}
