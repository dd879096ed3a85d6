//! Scheduler integration tests against an in-memory launcher

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{in_memory_authenticator, TestNode};
use keyhole::scheduler::{LaunchedNode, NodeLauncher, Scheduler, SchedulerConfig};
use keyhole::{KeyholeError, NodeId, Result};
use tokio::sync::oneshot;

/// Starts nothing; hands out a unique endpoint per launch
struct FakeLauncher {
    launches: AtomicUsize,
    startup: Duration,
    exits: std::sync::Mutex<Vec<oneshot::Sender<()>>>,
}

impl FakeLauncher {
    fn new(startup: Duration) -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            startup,
            exits: std::sync::Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl NodeLauncher for FakeLauncher {
    async fn launch(&self, node_id: NodeId) -> Result<LaunchedNode> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.startup).await;
        let (tx, rx) = oneshot::channel();
        self.exits.lock().unwrap().push(tx);
        Ok(LaunchedNode {
            endpoint: format!("http://10.0.0.{}:9735/{}", n + 1, node_id),
            exited: rx,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_concurrent_schedules_start_one_node() {
    let auth = in_memory_authenticator();
    let node = TestNode::new();
    let caller = node.authenticated(&auth).await;

    let launcher = FakeLauncher::new(Duration::from_millis(100));
    let scheduler = Scheduler::new(SchedulerConfig::default(), launcher.clone());

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let scheduler = scheduler.clone();
            let caller = caller.clone();
            let node_id = node.id();
            tokio::spawn(async move { scheduler.schedule(&caller, &node_id).await })
        })
        .collect();

    let mut endpoints = Vec::new();
    for handle in handles {
        endpoints.push(handle.await.unwrap().unwrap().endpoint);
    }

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    endpoints.dedup();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(scheduler.list().len(), 1);
}

#[tokio::test]
async fn test_waiting_lookup_sees_scheduled_node() {
    let auth = in_memory_authenticator();
    let node = TestNode::new();
    let caller = node.authenticated(&auth).await;

    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        FakeLauncher::new(Duration::from_millis(50)),
    );

    let waiter = {
        let scheduler = scheduler.clone();
        let caller = caller.clone();
        let node_id = node.id();
        tokio::spawn(async move { scheduler.get_node_info(&caller, &node_id, true).await })
    };

    // Without waiting there is nothing yet
    assert!(scheduler
        .get_node_info(&caller, &node.id(), false)
        .await
        .unwrap()
        .is_none());

    let scheduled = scheduler.schedule(&caller, &node.id()).await.unwrap();
    let seen = waiter.await.unwrap().unwrap().unwrap();
    assert_eq!(seen.endpoint, scheduled.endpoint);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_lookup_is_bounded() {
    let auth = in_memory_authenticator();
    let node = TestNode::new();
    let caller = node.authenticated(&auth).await;

    let scheduler = Scheduler::new(
        SchedulerConfig {
            max_wait: Duration::from_secs(2),
            ..SchedulerConfig::default()
        },
        FakeLauncher::new(Duration::from_millis(1)),
    );

    let started = tokio::time::Instant::now();
    let found = scheduler
        .get_node_info(&caller, &node.id(), true)
        .await
        .unwrap();
    assert!(found.is_none());
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_other_nodes_credentials_are_refused() {
    let auth = in_memory_authenticator();
    let alice = TestNode::new();
    let bob = TestNode::new();
    let alice_caller = alice.authenticated(&auth).await;

    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        FakeLauncher::new(Duration::from_millis(1)),
    );

    assert!(matches!(
        scheduler.schedule(&alice_caller, &bob.id()).await,
        Err(KeyholeError::Unauthenticated(_))
    ));
    assert!(matches!(
        scheduler.get_node_info(&alice_caller, &bob.id(), false).await,
        Err(KeyholeError::Unauthenticated(_))
    ));
}

#[tokio::test]
async fn test_exit_allows_reschedule() {
    let auth = in_memory_authenticator();
    let node = TestNode::new();
    let caller = node.authenticated(&auth).await;

    let launcher = FakeLauncher::new(Duration::from_millis(1));
    let scheduler = Scheduler::new(SchedulerConfig::default(), launcher.clone());

    let first = scheduler.schedule(&caller, &node.id()).await.unwrap();
    assert_eq!(
        scheduler.schedule(&caller, &node.id()).await.unwrap(),
        first
    );

    let exit = launcher.exits.lock().unwrap().pop().unwrap();
    exit.send(()).unwrap();
    for _ in 0..100 {
        if scheduler.stats().assignments == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = scheduler.schedule(&caller, &node.id()).await.unwrap();
    assert_ne!(first.endpoint, second.endpoint);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
}
