//! Master-side worker registry

use super::message::Message;
use crate::error::{Error, Result};
use crate::runner::RunnerState;
use crate::stats::Snapshot;

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One connected worker as seen by the master
#[derive(Debug)]
pub struct WorkerNode {
    /// Worker node id
    pub id: String,
    state: AtomicU8,
    heartbeat: AtomicI32,
    cpu_usage: AtomicI64,
    spawn_count: AtomicI64,
    sender: mpsc::Sender<Message>,
    stats: Mutex<BTreeMap<i64, Snapshot>>,
}

impl WorkerNode {
    /// Register a worker with a full heartbeat credit
    pub fn new(id: impl Into<String>, sender: mpsc::Sender<Message>, liveness: i32) -> Self {
        Self {
            id: id.into(),
            state: AtomicU8::new(RunnerState::Init as u8),
            heartbeat: AtomicI32::new(liveness),
            cpu_usage: AtomicI64::new(0),
            spawn_count: AtomicI64::new(0),
            sender,
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    /// Last known worker state
    pub fn state(&self) -> RunnerState {
        RunnerState::from_code(i64::from(self.state.load(Ordering::Acquire)))
            .unwrap_or(RunnerState::Init)
    }

    /// Record a worker state
    pub fn set_state(&self, state: RunnerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Counts toward the active worker count
    pub fn is_active(&self) -> bool {
        !matches!(self.state(), RunnerState::Missing | RunnerState::Quitting)
    }

    /// Restore the heartbeat credit
    pub fn reset_heartbeat(&self, liveness: i32) {
        self.heartbeat.store(liveness, Ordering::Release);
    }

    /// Spend one heartbeat credit, returning what is left
    pub fn tick_heartbeat(&self) -> i32 {
        self.heartbeat.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Remaining heartbeat credit
    pub fn heartbeat(&self) -> i32 {
        self.heartbeat.load(Ordering::Acquire)
    }

    /// Last reported CPU usage in percent
    pub fn cpu_usage(&self) -> i64 {
        self.cpu_usage.load(Ordering::Acquire)
    }

    /// Record reported CPU usage
    pub fn set_cpu_usage(&self, cpu_usage: i64) {
        self.cpu_usage.store(cpu_usage, Ordering::Release);
    }

    /// Units the worker reported after spawning
    pub fn spawn_count(&self) -> i64 {
        self.spawn_count.load(Ordering::Acquire)
    }

    /// Record the units the worker reported after spawning
    pub fn set_spawn_count(&self, count: i64) {
        self.spawn_count.store(count, Ordering::Release);
    }

    /// Latest snapshot of every run the worker reported
    pub fn stats(&self) -> Vec<Snapshot> {
        self.stats.lock().values().cloned().collect()
    }

    /// Store the latest snapshot of one worker run
    pub fn record_stats(&self, run: i64, snapshot: Snapshot) {
        self.stats.lock().insert(run, snapshot);
    }

    /// Forget all reported stats
    pub fn clear_stats(&self) {
        self.stats.lock().clear();
    }

    /// Queue a message for the worker's connection
    pub async fn send(&self, message: Message) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| Error::Transport(format!("connection to {} closed", self.id)))
    }

    /// Whether `sender` feeds this worker's connection
    pub fn uses(&self, sender: &mpsc::Sender<Message>) -> bool {
        self.sender.same_channel(sender)
    }
}

/// Registered workers keyed by node id
///
/// Readers take a snapshot of the current nodes before iterating, so
/// registration and removal never wait on a broadcast in progress.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    nodes: RwLock<HashMap<String, Arc<WorkerNode>>>,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a worker, returning the replaced node
    pub fn insert(&self, node: Arc<WorkerNode>) -> Option<Arc<WorkerNode>> {
        self.nodes.write().insert(node.id.clone(), node)
    }

    /// Remove a worker
    pub fn remove(&self, id: &str) -> Option<Arc<WorkerNode>> {
        self.nodes.write().remove(id)
    }

    /// Remove a worker only if it is still bound to `sender`'s connection
    pub fn remove_if_bound(
        &self,
        id: &str,
        sender: &mpsc::Sender<Message>,
    ) -> Option<Arc<WorkerNode>> {
        let mut nodes = self.nodes.write();
        if nodes.get(id).is_some_and(|node| node.uses(sender)) {
            nodes.remove(id)
        } else {
            None
        }
    }

    /// Look up a worker
    pub fn get(&self, id: &str) -> Option<Arc<WorkerNode>> {
        self.nodes.read().get(id).cloned()
    }

    /// All workers, sorted by id
    pub fn snapshot(&self) -> Vec<Arc<WorkerNode>> {
        let mut nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Workers that are neither missing nor quitting, sorted by id
    pub fn active(&self) -> Vec<Arc<WorkerNode>> {
        self.snapshot()
            .into_iter()
            .filter(|node| node.is_active())
            .collect()
    }

    /// Number of active workers
    pub fn active_count(&self) -> usize {
        self.nodes.read()
            .values()
            .filter(|node| node.is_active())
            .count()
    }

    /// Number of registered workers, missing ones included
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Check if no worker is registered
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Drop every worker
    pub fn clear(&self) {
        self.nodes.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::message::MessageType;

    fn node(id: &str) -> (Arc<WorkerNode>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(WorkerNode::new(id, tx, 3)), rx)
    }

    #[test]
    fn test_heartbeat_credit() {
        let (node, _rx) = node("w1");
        assert_eq!(node.tick_heartbeat(), 2);
        assert_eq!(node.tick_heartbeat(), 1);
        node.reset_heartbeat(3);
        assert_eq!(node.heartbeat(), 3);
    }

    #[test]
    fn test_active_excludes_missing() {
        let registry = WorkerRegistry::new();
        let (a, _ra) = node("a");
        let (b, _rb) = node("b");
        registry.insert(Arc::clone(&a));
        registry.insert(Arc::clone(&b));

        b.set_state(RunnerState::Missing);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active_count(), 1);
        assert_eq!(registry.active()[0].id, "a");
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let registry = WorkerRegistry::new();
        for id in ["c", "a", "b"] {
            let (n, _rx) = node(id);
            registry.insert(n);
        }
        let ids: Vec<_> = registry.snapshot().iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_remove_if_bound_ignores_replaced_connection() {
        let registry = WorkerRegistry::new();
        let (old_tx, _old_rx) = mpsc::channel(1);
        let (new_tx, _new_rx) = mpsc::channel(1);
        registry.insert(Arc::new(WorkerNode::new("w1", old_tx.clone(), 3)));
        registry.insert(Arc::new(WorkerNode::new("w1", new_tx.clone(), 3)));

        assert!(registry.remove_if_bound("w1", &old_tx).is_none());
        assert!(registry.remove_if_bound("w1", &new_tx).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stats_keep_latest_per_run() {
        let (node, _rx) = node("w1");
        let mut first = Snapshot::empty(RunnerState::Running, 1);
        first.total.num_requests = 5;
        node.record_stats(1, first.clone());
        first.total.num_requests = 9;
        node.record_stats(1, first);
        node.record_stats(2, Snapshot::empty(RunnerState::Running, 1));

        let stats = node.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].total.num_requests, 9);

        node.clear_stats();
        assert!(node.stats().is_empty());
    }

    #[tokio::test]
    async fn test_send_to_closed_connection_fails() {
        let (node, rx) = node("w1");
        drop(rx);
        assert!(node.send(Message::new(MessageType::Stop, "w1")).await.is_err());
    }
}
