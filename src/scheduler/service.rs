//! Node scheduler
//!
//! `schedule` returns the endpoint of the node process for an identity,
//! starting one if needed. Concurrent calls for the same identity share a
//! single launch: the first caller installs a shared future in `inflight`
//! and every other caller awaits that same future. The launch runs in its
//! own task so an impatient caller cannot cancel it for the others.
//!
//! Invariant: a launch is only started while holding the vacant `inflight`
//! entry and after re-checking that no assignment exists. The launch task
//! records its assignment before removing its `inflight` entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::launcher::NodeLauncher;
use super::registry::{AssignmentRegistry, ScheduleAssignment};
use crate::auth::AuthenticatedNode;
use crate::types::{KeyholeError, NodeId, Result};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on starting a node process
    pub spawn_timeout: Duration,
    /// Upper bound on a `GetNodeInfo(wait=true)` long poll
    pub max_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            spawn_timeout: Duration::from_secs(30),
            max_wait: Duration::from_secs(60),
        }
    }
}

type SharedLaunch = Shared<BoxFuture<'static, Result<ScheduleAssignment>>>;

/// Scheduler statistics
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub assignments: usize,
    pub launches_in_flight: usize,
    pub launches_started: u64,
    pub launches_failed: u64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    registry: AssignmentRegistry,
    launcher: Arc<dyn NodeLauncher>,
    inflight: DashMap<NodeId, SharedLaunch>,
    launches_started: AtomicU64,
    launches_failed: AtomicU64,
}

/// Locates and starts hosted node processes
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, launcher: Arc<dyn NodeLauncher>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                registry: AssignmentRegistry::new(),
                launcher,
                inflight: DashMap::new(),
                launches_started: AtomicU64::new(0),
                launches_failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &AssignmentRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Return the running node for `node_id`, starting it if necessary
    pub async fn schedule(
        &self,
        caller: &AuthenticatedNode,
        node_id: &NodeId,
    ) -> Result<ScheduleAssignment> {
        authorize(caller, node_id)?;

        if let Some(assignment) = self.inner.registry.get(node_id) {
            return Ok(assignment);
        }

        let launch = match self.inner.inflight.entry(*node_id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                if let Some(assignment) = self.inner.registry.get(node_id) {
                    return Ok(assignment);
                }

                let inner = Arc::clone(&self.inner);
                let id = *node_id;
                let handle = tokio::spawn(async move { inner.launch(id).await });
                let shared = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(KeyholeError::Scheduling(format!(
                            "launch task failed: {}",
                            e
                        ))),
                    }
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                shared
            }
        };

        launch.await
    }

    /// Look up the node for `node_id`, optionally long-polling until it exists
    pub async fn get_node_info(
        &self,
        caller: &AuthenticatedNode,
        node_id: &NodeId,
        wait: bool,
    ) -> Result<Option<ScheduleAssignment>> {
        authorize(caller, node_id)?;

        if !wait {
            return Ok(self.inner.registry.get(node_id));
        }
        Ok(self
            .inner
            .registry
            .wait(node_id, self.inner.config.max_wait)
            .await)
    }

    /// All running nodes
    pub fn list(&self) -> Vec<ScheduleAssignment> {
        self.inner.registry.list()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            assignments: self.inner.registry.len(),
            launches_in_flight: self.inner.inflight.len(),
            launches_started: self.inner.launches_started.load(Ordering::Relaxed),
            launches_failed: self.inner.launches_failed.load(Ordering::Relaxed),
        }
    }
}

impl SchedulerInner {
    async fn launch(self: Arc<Self>, node_id: NodeId) -> Result<ScheduleAssignment> {
        self.launches_started.fetch_add(1, Ordering::Relaxed);
        info!(node_id = %node_id, "Starting node");

        let result =
            match tokio::time::timeout(self.config.spawn_timeout, self.launcher.launch(node_id))
                .await
            {
                Ok(Ok(launched)) => {
                    let assignment = ScheduleAssignment {
                        node_id,
                        endpoint: launched.endpoint,
                        instance_id: Uuid::new_v4(),
                        started_at: Utc::now(),
                    };
                    self.registry.record(assignment.clone());
                    self.watch_exit(node_id, assignment.instance_id, launched.exited);
                    Ok(assignment)
                }
                Ok(Err(e)) => {
                    error!(node_id = %node_id, "Node failed to start: {}", e);
                    Err(match e {
                        KeyholeError::Scheduling(_) => e,
                        other => KeyholeError::Scheduling(other.to_string()),
                    })
                }
                Err(_) => {
                    error!(
                        node_id = %node_id,
                        "Node did not start within {:?}", self.config.spawn_timeout
                    );
                    Err(KeyholeError::Scheduling(format!(
                        "node did not start within {:?}",
                        self.config.spawn_timeout
                    )))
                }
            };

        if result.is_err() {
            self.launches_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inflight.remove(&node_id);
        result
    }

    fn watch_exit(
        self: &Arc<Self>,
        node_id: NodeId,
        instance_id: Uuid,
        exited: tokio::sync::oneshot::Receiver<()>,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _ = exited.await;
            if inner.registry.clear(&node_id, instance_id) {
                warn!(node_id = %node_id, instance = %instance_id, "Node exited, assignment cleared");
            }
        });
    }
}

fn authorize(caller: &AuthenticatedNode, node_id: &NodeId) -> Result<()> {
    if caller.node_id() != node_id {
        warn!(
            caller = %caller.node_id(),
            node_id = %node_id,
            "Credential presented for another node"
        );
        return Err(KeyholeError::Unauthenticated(
            "credential does not belong to the requested node".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::launcher::LaunchedNode;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    /// Launcher double that counts starts and lets tests end processes
    struct CountingLauncher {
        launches: AtomicUsize,
        delay: Duration,
        fail_first: bool,
        exits: Mutex<Vec<oneshot::Sender<()>>>,
    }

    impl CountingLauncher {
        fn new(delay: Duration) -> Self {
            Self {
                launches: AtomicUsize::new(0),
                delay,
                fail_first: false,
                exits: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl NodeLauncher for CountingLauncher {
        async fn launch(&self, node_id: NodeId) -> Result<LaunchedNode> {
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_first && n == 0 {
                return Err(KeyholeError::Scheduling("boom".into()));
            }
            let (tx, rx) = oneshot::channel();
            self.exits.lock().unwrap().push(tx);
            Ok(LaunchedNode {
                endpoint: format!("http://node-{}-{}", &node_id.to_hex()[..8], n),
                exited: rx,
            })
        }
    }

    fn caller(byte: u8) -> (AuthenticatedNode, NodeId) {
        let node = NodeId::from_bytes([byte; 32]);
        (AuthenticatedNode::for_tests(node), node)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_schedule_is_single_flight() {
        let launcher = Arc::new(CountingLauncher::new(Duration::from_millis(50)));
        let scheduler = Scheduler::new(SchedulerConfig::default(), launcher.clone());
        let (caller, node) = caller(1);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let scheduler = scheduler.clone();
            let caller = caller.clone();
            handles.push(tokio::spawn(async move {
                scheduler.schedule(&caller, &node).await
            }));
        }

        let mut endpoints = Vec::new();
        for handle in handles {
            endpoints.push(handle.await.unwrap().unwrap().endpoint);
        }

        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
        assert!(endpoints.iter().all(|e| e == &endpoints[0]));
        assert_eq!(scheduler.stats().launches_in_flight, 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison() {
        let mut launcher = CountingLauncher::new(Duration::from_millis(1));
        launcher.fail_first = true;
        let launcher = Arc::new(launcher);
        let scheduler = Scheduler::new(SchedulerConfig::default(), launcher.clone());
        let (caller, node) = caller(2);

        assert!(matches!(
            scheduler.schedule(&caller, &node).await,
            Err(KeyholeError::Scheduling(_))
        ));
        assert!(scheduler.schedule(&caller, &node).await.is_ok());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.stats().launches_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_timeout() {
        let launcher = Arc::new(CountingLauncher::new(Duration::from_secs(600)));
        let scheduler = Scheduler::new(
            SchedulerConfig {
                spawn_timeout: Duration::from_secs(1),
                ..SchedulerConfig::default()
            },
            launcher,
        );
        let (caller, node) = caller(3);

        let err = scheduler.schedule(&caller, &node).await.unwrap_err();
        assert!(matches!(err, KeyholeError::Scheduling(_)));
        assert!(scheduler.registry().get(&node).is_none());
    }

    #[tokio::test]
    async fn test_wait_returns_scheduled_assignment() {
        let launcher = Arc::new(CountingLauncher::new(Duration::from_millis(50)));
        let scheduler = Scheduler::new(SchedulerConfig::default(), launcher);
        let (caller, node) = caller(4);

        let waiter = {
            let scheduler = scheduler.clone();
            let caller = caller.clone();
            tokio::spawn(async move { scheduler.get_node_info(&caller, &node, true).await })
        };
        tokio::task::yield_now().await;

        let scheduled = scheduler.schedule(&caller, &node).await.unwrap();
        let waited = waiter.await.unwrap().unwrap();
        assert_eq!(waited, Some(scheduled));
    }

    #[tokio::test]
    async fn test_no_wait_returns_immediately() {
        let launcher = Arc::new(CountingLauncher::new(Duration::from_millis(1)));
        let scheduler = Scheduler::new(SchedulerConfig::default(), launcher);
        let (caller, node) = caller(5);
        assert_eq!(
            scheduler.get_node_info(&caller, &node, false).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_exit_clears_assignment_and_allows_restart() {
        let launcher = Arc::new(CountingLauncher::new(Duration::from_millis(1)));
        let scheduler = Scheduler::new(SchedulerConfig::default(), launcher.clone());
        let (caller, node) = caller(6);

        let first = scheduler.schedule(&caller, &node).await.unwrap();
        let exit = launcher.exits.lock().unwrap().pop().unwrap();
        exit.send(()).unwrap();

        for _ in 0..100 {
            if scheduler.registry().get(&node).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(scheduler.registry().get(&node).is_none());

        let second = scheduler.schedule(&caller, &node).await.unwrap();
        assert_ne!(first.instance_id, second.instance_id);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_foreign_credential_rejected() {
        let launcher = Arc::new(CountingLauncher::new(Duration::from_millis(1)));
        let scheduler = Scheduler::new(SchedulerConfig::default(), launcher);
        let (caller, _) = caller(7);
        let other = NodeId::from_bytes([8; 32]);
        assert!(matches!(
            scheduler.schedule(&caller, &other).await,
            Err(KeyholeError::Unauthenticated(_))
        ));
    }
}
