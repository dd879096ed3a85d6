//! HSM relay
//!
//! Correlates signing requests from a hosted node's stream with answers from
//! the remote signer devices bound to the same identity. Each identity has a
//! queue: its attached signer sessions and the requests still outstanding.
//! Requests issued while no signer is attached wait there and are handed to
//! the next session that attaches. Request ids are assigned and requests
//! broadcast under the identity's queue entry, so every signer sees them in
//! issuance order.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info};

use super::capabilities::CapabilityGrants;
use super::messages::{HsmRequest, HsmRequestContext, HsmResponse};
use super::pending::{PendingTable, SessionId, StreamId};
use crate::auth::AuthenticatedNode;
use crate::types::{KeyholeError, NodeId, Result};

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Deadline for a signer to answer a request
    pub request_timeout: Duration,
    /// Interval of the background deadline sweep
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Relay statistics
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub pending: usize,
    /// Requests waiting for a signer to attach
    pub queued: usize,
    pub signers: usize,
    pub node_streams: u64,
    pub grants: usize,
}

struct AttachedSigner {
    session: SessionId,
    tx: mpsc::UnboundedSender<HsmRequest>,
}

#[derive(Default)]
struct NodeQueue {
    signers: Vec<AttachedSigner>,
    /// Requests not yet resolved, in issuance order. Resolved ones are
    /// pruned lazily against the pending table.
    outstanding: VecDeque<HsmRequest>,
}

impl NodeQueue {
    /// Hand the request to every attached signer. Returns false if none
    /// took it.
    fn broadcast(&mut self, request: &HsmRequest) -> bool {
        self.signers.retain(|s| s.tx.send(request.clone()).is_ok());
        !self.signers.is_empty()
    }

    fn prune(&mut self, pending: &PendingTable) {
        self.outstanding.retain(|r| pending.contains(r.request_id));
    }
}

struct RelayInner {
    config: RelayConfig,
    pending: PendingTable,
    grants: CapabilityGrants,
    queues: DashMap<NodeId, NodeQueue>,
    next_stream: AtomicU64,
    next_session: AtomicU64,
    open_streams: AtomicU64,
}

/// Relay between hosted nodes and their remote signers
#[derive(Clone)]
pub struct HsmRelay {
    inner: Arc<RelayInner>,
}

impl HsmRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                config,
                pending: PendingTable::new(),
                grants: CapabilityGrants::new(),
                queues: DashMap::new(),
                next_stream: AtomicU64::new(1),
                next_session: AtomicU64::new(1),
                open_streams: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn grants(&self) -> &CapabilityGrants {
        &self.inner.grants
    }

    /// Open the request stream of a hosted node
    pub fn open_node_stream(&self, node: &AuthenticatedNode) -> NodeStream {
        let node_id = *node.node_id();
        let stream = self.inner.next_stream.fetch_add(1, Ordering::Relaxed);
        self.inner.grants.open_node(&node_id);
        self.inner.open_streams.fetch_add(1, Ordering::Relaxed);
        info!(node_id = %node_id, stream, "Node stream opened");

        NodeStream {
            inner: Arc::clone(&self.inner),
            node_id,
            stream,
            closed: AtomicBool::new(false),
        }
    }

    /// Attach a signer device for the node. Several devices may be attached
    /// at once: each receives every request, and the first answer wins. A new
    /// session starts with every request still outstanding for the node.
    pub fn attach_signer(&self, node: &AuthenticatedNode) -> SignerSession {
        let node_id = *node.node_id();
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let (replayed, signers) = {
            let pending = &self.inner.pending;
            let mut queue = self.inner.queues.entry(node_id).or_default();
            queue.prune(pending);
            for request in &queue.outstanding {
                // The receiver is held right here, so delivery cannot fail
                let _ = tx.send(request.clone());
                pending.mark_delivered(request.request_id);
            }
            queue.signers.push(AttachedSigner { session, tx });
            (queue.outstanding.len(), queue.signers.len())
        };

        info!(node_id = %node_id, session, replayed, signers, "Signer attached");

        SignerSession {
            inner: Arc::clone(&self.inner),
            node_id,
            session,
            requests: rx,
        }
    }

    /// Time out every request past its deadline and prune idle queues
    pub fn sweep(&self) -> usize {
        let expired = self.inner.pending.sweep_expired(Instant::now());
        let pending = &self.inner.pending;
        self.inner.queues.retain(|_, queue| {
            queue.prune(pending);
            !queue.signers.is_empty() || !queue.outstanding.is_empty()
        });
        expired
    }

    pub fn stats(&self) -> RelayStats {
        let mut queued = 0;
        let mut signers = 0;
        for queue in self.inner.queues.iter() {
            queued += queue
                .outstanding
                .iter()
                .filter(|r| self.inner.pending.awaiting_delivery(r.request_id))
                .count();
            signers += queue.signers.len();
        }
        RelayStats {
            pending: self.inner.pending.len(),
            queued,
            signers,
            node_streams: self.inner.open_streams.load(Ordering::Relaxed),
            grants: self.inner.grants.len(),
        }
    }
}

impl RelayInner {
    /// Register the request and hand it to the node's signers. Both happen
    /// under the identity's queue entry, so every signer sees the node's
    /// requests in issuance order.
    fn dispatch(
        self: &Arc<Self>,
        context: HsmRequestContext,
        stream: StreamId,
        raw: Vec<u8>,
    ) -> PendingRequest {
        let deadline = Instant::now() + self.config.request_timeout;
        let node_id = context.node_id;
        let mut queue = self.queues.entry(node_id).or_default();

        while let Some(front) = queue.outstanding.front() {
            if self.pending.contains(front.request_id) {
                break;
            }
            queue.outstanding.pop_front();
        }

        let registered = self.pending.register(context.clone(), stream, deadline);
        let request = HsmRequest {
            request_id: registered.request_id,
            context,
            raw,
        };

        if queue.broadcast(&request) {
            self.pending.mark_delivered(request.request_id);
        } else {
            debug!(
                node_id = %node_id,
                request_id = request.request_id,
                "No signer attached, request queued"
            );
        }
        queue.outstanding.push_back(request);

        PendingRequest {
            inner: Arc::clone(self),
            request_id: registered.request_id,
            completion: registered.completion,
            sleep: Box::pin(tokio::time::sleep_until(registered.deadline)),
            done: false,
        }
    }
}

/// A hosted node's request stream. Closing it (or dropping it) fails every
/// request it still has outstanding.
pub struct NodeStream {
    inner: Arc<RelayInner>,
    node_id: NodeId,
    stream: StreamId,
    closed: AtomicBool,
}

impl NodeStream {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Authorize and dispatch a request. Dispatch order is the order the
    /// signer sees; await the returned handle for the answer.
    pub fn submit(&self, dbid: u64, capabilities: u64, raw: Vec<u8>) -> Result<PendingRequest> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KeyholeError::ConnectionLost("node stream closed".into()));
        }
        self.inner.grants.check(&self.node_id, dbid, capabilities)?;

        let context = HsmRequestContext {
            node_id: self.node_id,
            dbid,
            capabilities,
        };
        debug!(node_id = %self.node_id, dbid, len = raw.len(), "Dispatching signing request");
        let pending = self.inner.dispatch(context, self.stream, raw);

        // Lost a race with close(); it may not have seen this entry
        if self.closed.load(Ordering::SeqCst) {
            self.inner.pending.fail_stream(self.stream);
        }
        Ok(pending)
    }

    /// Submit and wait for the signer's answer
    pub async fn request(&self, dbid: u64, capabilities: u64, raw: Vec<u8>) -> Result<Vec<u8>> {
        self.submit(dbid, capabilities, raw)?.await
    }

    /// Grant capabilities to a client dbid
    pub fn grant_client(&self, dbid: u64, capabilities: u64) -> Result<()> {
        self.inner.grants.grant(&self.node_id, dbid, capabilities)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.open_streams.fetch_sub(1, Ordering::Relaxed);
        let failed = self.inner.pending.fail_stream(self.stream);
        info!(node_id = %self.node_id, stream = self.stream, failed, "Node stream closed");
    }
}

impl Drop for NodeStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Caller's handle on one in-flight request. Resolves with the signer's
/// answer, [`KeyholeError::RequestTimeout`] or
/// [`KeyholeError::ConnectionLost`]. Dropping it abandons the request.
pub struct PendingRequest {
    inner: Arc<RelayInner>,
    request_id: u32,
    completion: oneshot::Receiver<Result<Vec<u8>>>,
    sleep: Pin<Box<Sleep>>,
    done: bool,
}

impl PendingRequest {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }
}

impl Future for PendingRequest {
    type Output = Result<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Poll::Ready(outcome) = Pin::new(&mut this.completion).poll(cx) {
            this.done = true;
            return Poll::Ready(outcome.unwrap_or_else(|_| {
                Err(KeyholeError::ConnectionLost("relay dropped request".into()))
            }));
        }

        if this.sleep.as_mut().poll(cx).is_ready() {
            this.done = true;
            if this.inner.pending.expire(this.request_id) {
                return Poll::Ready(Err(KeyholeError::RequestTimeout(this.request_id)));
            }
            // Another terminal event won the race; it already sent its outcome
            return Poll::Ready(match this.completion.try_recv() {
                Ok(outcome) => outcome,
                Err(_) => Err(KeyholeError::RequestTimeout(this.request_id)),
            });
        }

        Poll::Pending
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.done {
            self.inner.pending.cancel(self.request_id);
        }
    }
}

/// A remote signer device's session for one node identity
pub struct SignerSession {
    inner: Arc<RelayInner>,
    node_id: NodeId,
    session: SessionId,
    requests: mpsc::UnboundedReceiver<HsmRequest>,
}

impl SignerSession {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    /// Next request for the signer, in issuance order
    pub async fn next_request(&mut self) -> Option<HsmRequest> {
        self.requests.recv().await
    }

    /// Deliver the signer's answer. A response for a request that is no
    /// longer pending (answered by another device, timed out, abandoned) is
    /// discarded and reported as [`KeyholeError::DuplicateResponse`]; no
    /// caller is affected.
    pub fn submit_response(&self, response: HsmResponse) -> Result<()> {
        self.inner
            .pending
            .complete(&self.node_id, response.request_id, response.raw)
    }
}

impl Drop for SignerSession {
    fn drop(&mut self) {
        let mut failed = 0;
        let mut remaining = 0;
        if let Some(mut queue) = self.inner.queues.get_mut(&self.node_id) {
            queue.signers.retain(|s| s.session != self.session);
            remaining = queue.signers.len();
            // Other devices hold every delivered request too
            if remaining == 0 {
                failed = self.inner.pending.fail_delivered(&self.node_id);
            }
        }
        info!(
            node_id = %self.node_id,
            session = self.session,
            remaining,
            failed,
            "Signer session ended"
        );
    }
}

/// Periodically time out requests past their deadline
pub fn spawn_sweep_task(relay: HsmRelay) -> JoinHandle<()> {
    let interval = relay.config().sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = relay.sweep();
            if expired > 0 {
                debug!(expired, "Relay sweep timed out requests");
            }
        }
    })
}
