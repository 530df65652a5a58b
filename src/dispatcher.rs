//! Node Dispatcher Module
//!
//! Registers nodes, hands out sessions, tracks liveness through heartbeat
//! deadlines, and streams task state. One registered entry exists per node
//! identity; every fresh registration issues a new session identifier and
//! invalidates the streams of the previous one.
//!
//! Locking: the dispatcher mutex guards only the node map (insert, lookup,
//! delete); all per-node mutation takes the node's own mutex. Lock order
//! is dispatcher then node, never the reverse. Neither lock is held across
//! an await.
//!
//! Streaming: `tasks` and `session` spawn one cooperative task each, which
//! owns a store watch subscription, a session-watch receiver, and the
//! output channel, and returns as soon as any of them terminates. The
//! session identifier is high entropy and is never logged.

use crate::configs::DispatcherConfig;
use crate::error::{DispatcherError, StoreError};
use crate::heartbeat::Heartbeat;
use crate::messages::{
    Node, NodeSpec, NodeState, NodeStatus, SessionMessage, Task, TaskStatusUpdate, TasksMessage,
    WeightedPeer,
};
use crate::store::{MemoryStore, StoreEvent};
use crate::watch::EventFilter;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// Queue depth of one task/session stream before backpressure applies.
const STREAM_CHANNEL_CAPACITY: usize = 16;

struct NodeEntry {
    session_id: String,
    heartbeat: Heartbeat,
}

struct RegisteredNode {
    /// Publishes the live session id; streams subscribe and terminate
    /// when it no longer matches theirs.
    session_watch: watch::Sender<String>,
    entry: Mutex<NodeEntry>,
}

impl RegisteredNode {
    fn check_session(&self, session_id: &str) -> Result<(), DispatcherError> {
        let entry = self.entry.lock().unwrap();
        if entry.session_id != session_id {
            return Err(DispatcherError::InvalidSession);
        }
        Ok(())
    }
}

/// Dispatches task state to registered nodes and tracks their health.
pub struct Dispatcher {
    nodes: Mutex<HashMap<String, Arc<RegisteredNode>>>,
    store: Arc<MemoryStore>,
    config: DispatcherConfig,
    weak_self: Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(store: Arc<MemoryStore>, config: DispatcherConfig) -> Arc<Dispatcher> {
        Arc::new_cyclic(|weak_self| Dispatcher {
            nodes: Mutex::new(HashMap::new()),
            store,
            config,
            weak_self: weak_self.clone(),
        })
    }

    /// Register a node (or refresh an existing registration), returning
    /// `(node_id, session_id)`. Always allocates a fresh session id, which
    /// invalidates any prior streams, arms the heartbeat deadline, and
    /// upserts the node in the store with status `Ready`.
    pub async fn register(&self, spec: NodeSpec) -> Result<(String, String), DispatcherError> {
        debug!(node_id = %spec.id, "dispatcher register");
        let node_id = spec.id.clone();
        let session_id = new_session_id();
        let grace = self.choose_period() * self.config.grace_period_multiplier;
        let heartbeat = self.arm_heartbeat(&node_id, grace);

        let mut record = Node::new(spec);
        record.status = NodeStatus::new(NodeState::Ready);

        {
            let mut nodes = self.nodes.lock().unwrap();
            match nodes.get(&node_id) {
                Some(existing) => {
                    let mut entry = existing.entry.lock().unwrap();
                    entry.heartbeat.stop();
                    entry.session_id = session_id.clone();
                    entry.heartbeat = heartbeat;
                    drop(entry);
                    let _ = existing.session_watch.send(session_id.clone());
                }
                None => {
                    let (session_watch, _) = watch::channel(session_id.clone());
                    nodes.insert(
                        node_id.clone(),
                        Arc::new(RegisteredNode {
                            session_watch,
                            entry: Mutex::new(NodeEntry {
                                session_id: session_id.clone(),
                                heartbeat,
                            }),
                        }),
                    );
                }
            }
        }

        self.store.update(|tx| tx.create_or_update_node(record))?;
        Ok((node_id, session_id))
    }

    /// Apply a batch of task status updates in one store transaction.
    pub async fn update_task_status(
        &self,
        node_id: &str,
        session_id: &str,
        updates: Vec<TaskStatusUpdate>,
    ) -> Result<(), DispatcherError> {
        debug!(node_id, count = updates.len(), "dispatcher update task status");
        let node = self.registered_node(node_id)?;
        node.check_session(session_id)?;

        self.store.update(|tx| {
            for update in &updates {
                let mut task = tx.get_task(&update.task_id).ok_or(StoreError::NotFound)?;
                task.status = update.status.clone();
                tx.update_task(task)?;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Stream of the full task set addressed to a node: an initial
    /// snapshot, then a re-send whenever a matching task event lands. A
    /// task missing from a message is to be terminated by the agent. The
    /// stream ends with `Err(InvalidSession)` when the session is revoked
    /// and silently when the receiver is dropped.
    pub async fn tasks(
        &self,
        node_id: &str,
        session_id: &str,
    ) -> Result<mpsc::Receiver<Result<TasksMessage, DispatcherError>>, DispatcherError> {
        debug!(node_id, "dispatcher tasks stream");
        let node = self.registered_node(node_id)?;
        node.check_session(session_id)?;

        // Subscribe before the snapshot so no event between the two is
        // lost.
        let filter_node_id = node_id.to_string();
        let filter: EventFilter = Arc::new(move |event| {
            matches!(
                event,
                StoreEvent::CreateTask(t) | StoreEvent::UpdateTask(t) | StoreEvent::DeleteTask(t)
                    if t.node_id == filter_node_id
            )
        });
        let mut events = self.store.watch_queue().watch(filter);
        let mut session_rx = node.session_watch.subscribe();

        let mut task_map: HashMap<String, Task> = self
            .store
            .view(|tx| tx.tasks_by_node(node_id))
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();

        let session_id = session_id.to_string();
        let (out_tx, out_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                if *session_rx.borrow() != session_id {
                    let _ = out_tx.send(Err(DispatcherError::InvalidSession)).await;
                    return;
                }

                let message = TasksMessage {
                    tasks: task_map.values().cloned().collect(),
                };
                if out_tx.send(Ok(message)).await.is_err() {
                    // Receiver dropped: the peer cancelled.
                    return;
                }

                tokio::select! {
                    event = events.recv() => match event {
                        Some(StoreEvent::CreateTask(t)) | Some(StoreEvent::UpdateTask(t)) => {
                            task_map.insert(t.id.clone(), t);
                        }
                        Some(StoreEvent::DeleteTask(t)) => {
                            task_map.remove(&t.id);
                        }
                        Some(_) => {}
                        // Disconnected by the watch queue; the agent must
                        // reconnect and resync.
                        None => return,
                    },
                    changed = session_rx.changed() => {
                        if changed.is_err() || *session_rx.borrow() != session_id {
                            let _ = out_tx.send(Err(DispatcherError::InvalidSession)).await;
                            return;
                        }
                    }
                    _ = out_tx.closed() => return,
                }
            }
        });
        Ok(out_rx)
    }

    /// Acknowledge a heartbeat: pick the next jittered period, push the
    /// node's deadline out to `period * grace_period_multiplier`, and
    /// return the period so the peer can schedule its next beat.
    pub async fn heartbeat(
        &self,
        node_id: &str,
        session_id: &str,
    ) -> Result<Duration, DispatcherError> {
        debug!(node_id, "dispatcher heartbeat");
        let node = self.registered_node(node_id)?;
        let period = self.choose_period();
        let grace = period * self.config.grace_period_multiplier;

        let entry = node.entry.lock().unwrap();
        if entry.session_id != session_id {
            return Err(DispatcherError::InvalidSession);
        }
        entry.heartbeat.update(grace);
        entry.heartbeat.beat();
        Ok(period)
    }

    /// Connection-control stream: the current manager peers on a fixed
    /// cadence, ending with `Err(InvalidSession)` once the session is
    /// revoked.
    pub async fn session(
        &self,
        node_id: &str,
        session_id: &str,
    ) -> Result<mpsc::Receiver<Result<SessionMessage, DispatcherError>>, DispatcherError> {
        debug!(node_id, "dispatcher session stream");
        let node = self.registered_node(node_id)?;
        node.check_session(session_id)?;

        let mut session_rx = node.session_watch.subscribe();
        let managers = self.managers();
        let cadence = self.config.heartbeat_period();
        let session_id = session_id.to_string();

        let (out_tx, out_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            loop {
                if *session_rx.borrow() != session_id {
                    let _ = out_tx.send(Err(DispatcherError::InvalidSession)).await;
                    return;
                }
                let message = SessionMessage {
                    managers: managers.clone(),
                    disconnect: false,
                };
                if out_tx.send(Ok(message)).await.is_err() {
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(cadence) => {}
                    changed = session_rx.changed() => {
                        if changed.is_err() || *session_rx.borrow() != session_id {
                            let _ = out_tx.send(Err(DispatcherError::InvalidSession)).await;
                            return;
                        }
                    }
                    _ = out_tx.closed() => return,
                }
            }
        });
        Ok(out_rx)
    }

    /// Node identities currently considered live.
    pub fn live_nodes(&self) -> Vec<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
    }

    /// Drop every registration and stop the heartbeats, for shutdown.
    pub fn shutdown(&self) {
        let nodes = std::mem::take(&mut *self.nodes.lock().unwrap());
        for node in nodes.values() {
            node.entry.lock().unwrap().heartbeat.stop();
        }
    }

    /// Remove a node from the live set and transition its store row to
    /// `Down`. Heartbeat expiry lands here; it is a state transition, not
    /// an error.
    fn node_down(&self, node_id: &str) -> Result<(), DispatcherError> {
        let removed = self.nodes.lock().unwrap().remove(node_id);
        if let Some(node) = removed {
            node.entry.lock().unwrap().heartbeat.stop();
        }
        self.store.update(|tx| {
            let mut node = tx.get_node(node_id).ok_or(StoreError::NotFound)?;
            node.status = NodeStatus::new(NodeState::Down);
            tx.update_node(node)
        })?;
        Ok(())
    }

    fn arm_heartbeat(&self, node_id: &str, ttl: Duration) -> Heartbeat {
        let weak = self.weak_self.clone();
        let node_id = node_id.to_string();
        Heartbeat::new(ttl, move || {
            if let Some(dispatcher) = weak.upgrade() {
                if let Err(e) = dispatcher.node_down(&node_id) {
                    error!(node_id = %node_id, error = %e, "failed to mark node down after missed heartbeats");
                }
            }
        })
    }

    fn registered_node(&self, node_id: &str) -> Result<Arc<RegisteredNode>, DispatcherError> {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .ok_or(DispatcherError::NodeNotRegistered)
    }

    fn managers(&self) -> Vec<WeightedPeer> {
        vec![WeightedPeer {
            addr: self.config.addr.clone(),
            weight: 1,
        }]
    }

    /// Jittered heartbeat period in `[base - epsilon, base + epsilon]`.
    fn choose_period(&self) -> Duration {
        let base = self.config.heartbeat_period();
        let epsilon = self.config.heartbeat_epsilon();
        if epsilon.is_zero() {
            return base;
        }
        let epsilon_ns = epsilon.as_nanos() as i64;
        let adjustment = rand::thread_rng().gen_range(-epsilon_ns..=epsilon_ns);
        if adjustment >= 0 {
            base + Duration::from_nanos(adjustment as u64)
        } else {
            base.saturating_sub(Duration::from_nanos(adjustment.unsigned_abs()))
        }
    }
}

/// Session identifiers are local to the dispatcher: sixteen random bytes,
/// hex encoded. Treated as high entropy and kept out of log fields;
/// authorization itself stays with the TLS layer.
fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{NodeRole, TaskState, TaskStatus};
    use std::collections::HashSet;
    use tokio::time::{sleep, timeout};

    fn test_config(period: Duration, epsilon: Duration) -> DispatcherConfig {
        DispatcherConfig {
            addr: "10.0.0.1:4242".to_string(),
            heartbeat_period_ms: period.as_millis() as u64,
            heartbeat_epsilon_ms: epsilon.as_millis() as u64,
            grace_period_multiplier: 3,
        }
    }

    fn spec(id: &str) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            role: NodeRole::Worker,
        }
    }

    fn task(id: &str, node_id: &str) -> Task {
        Task {
            id: id.to_string(),
            node_id: node_id.to_string(),
            status: TaskStatus::new(TaskState::Assigned),
        }
    }

    fn task_ids(message: &TasksMessage) -> HashSet<String> {
        message.tasks.iter().map(|t| t.id.clone()).collect()
    }

    fn ids(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_marks_node_ready() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            test_config(Duration::from_secs(5), Duration::from_millis(500)),
        );

        let (node_id, session_id) = dispatcher.register(spec("n1")).await.unwrap();
        assert_eq!(node_id, "n1");
        assert_eq!(session_id.len(), 32);

        let node = store.view(|tx| tx.get_node("n1")).unwrap();
        assert_eq!(node.status.state, NodeState::Ready);
        assert_eq!(dispatcher.live_nodes(), vec!["n1".to_string()]);
    }

    #[tokio::test]
    async fn test_reregister_changes_session() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            store,
            test_config(Duration::from_secs(5), Duration::from_millis(500)),
        );

        let (_, first) = dispatcher.register(spec("n1")).await.unwrap();
        let (_, second) = dispatcher.register(spec("n1")).await.unwrap();
        assert_ne!(first, second);

        // Only one live entry exists, and only the new session is valid.
        assert_eq!(dispatcher.live_nodes().len(), 1);
        assert!(matches!(
            dispatcher.heartbeat("n1", &first).await,
            Err(DispatcherError::InvalidSession)
        ));
        assert!(dispatcher.heartbeat("n1", &second).await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_period_is_jittered_within_bounds() {
        let store = Arc::new(MemoryStore::new());
        let base = Duration::from_secs(5);
        let epsilon = Duration::from_millis(500);
        let dispatcher = Dispatcher::new(store, test_config(base, epsilon));

        let (_, session_id) = dispatcher.register(spec("n1")).await.unwrap();
        for _ in 0..32 {
            let period = dispatcher.heartbeat("n1", &session_id).await.unwrap();
            assert!(period >= base - epsilon && period <= base + epsilon, "{period:?}");
        }
    }

    #[tokio::test]
    async fn test_unknown_node_and_stale_session() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            store,
            test_config(Duration::from_secs(5), Duration::from_millis(500)),
        );

        assert!(matches!(
            dispatcher.heartbeat("ghost", "whatever").await,
            Err(DispatcherError::NodeNotRegistered)
        ));
        assert!(matches!(
            dispatcher.tasks("ghost", "whatever").await,
            Err(DispatcherError::NodeNotRegistered)
        ));

        let (_, _session_id) = dispatcher.register(spec("n1")).await.unwrap();
        assert!(matches!(
            dispatcher.update_task_status("n1", "stale", Vec::new()).await,
            Err(DispatcherError::InvalidSession)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_take_node_down() {
        let store = Arc::new(MemoryStore::new());
        let period = Duration::from_millis(50);
        let dispatcher = Dispatcher::new(store.clone(), test_config(period, Duration::ZERO));

        let (_, session_id) = dispatcher.register(spec("n1")).await.unwrap();
        assert_eq!(dispatcher.live_nodes(), vec!["n1".to_string()]);

        // Keep beating: the node stays live past several grace windows.
        for _ in 0..10 {
            sleep(Duration::from_millis(100)).await;
            dispatcher.heartbeat("n1", &session_id).await.unwrap();
        }
        assert_eq!(dispatcher.live_nodes(), vec!["n1".to_string()]);

        // Go quiet past period * multiplier: removed and marked down.
        sleep(period * 3 + Duration::from_millis(50)).await;
        assert!(dispatcher.live_nodes().is_empty());
        let node = store.view(|tx| tx.get_node("n1")).unwrap();
        assert_eq!(node.status.state, NodeState::Down);

        // The node must re-register to come back.
        assert!(matches!(
            dispatcher.heartbeat("n1", &session_id).await,
            Err(DispatcherError::NodeNotRegistered)
        ));
        dispatcher.register(spec("n1")).await.unwrap();
        let node = store.view(|tx| tx.get_node("n1")).unwrap();
        assert_eq!(node.status.state, NodeState::Ready);
    }

    #[tokio::test]
    async fn test_tasks_stream_snapshot_and_deltas() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            test_config(Duration::from_secs(5), Duration::from_millis(500)),
        );

        store
            .update(|tx| {
                tx.create_task(task("t1", "n1"))?;
                tx.create_task(task("t2", "n1"))?;
                tx.create_task(task("other", "n2"))
            })
            .unwrap();

        let (_, session_id) = dispatcher.register(spec("n1")).await.unwrap();
        let mut stream = dispatcher.tasks("n1", &session_id).await.unwrap();

        let snapshot = stream.recv().await.unwrap().unwrap();
        assert_eq!(task_ids(&snapshot), ids(&["t1", "t2"]));

        store.update(|tx| tx.create_task(task("t3", "n1"))).unwrap();
        let message = stream.recv().await.unwrap().unwrap();
        assert_eq!(task_ids(&message), ids(&["t1", "t2", "t3"]));

        store.update(|tx| tx.delete_task("t1")).unwrap();
        let message = stream.recv().await.unwrap().unwrap();
        assert_eq!(task_ids(&message), ids(&["t2", "t3"]));

        // Events for other nodes do not wake this stream.
        store.update(|tx| tx.create_task(task("other2", "n2"))).unwrap();
        store.update(|tx| tx.delete_task("t2")).unwrap();
        let message = stream.recv().await.unwrap().unwrap();
        assert_eq!(task_ids(&message), ids(&["t3"]));
    }

    #[tokio::test]
    async fn test_reregister_terminates_streams() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            test_config(Duration::from_secs(5), Duration::from_millis(500)),
        );

        let (_, session_id) = dispatcher.register(spec("n1")).await.unwrap();
        let mut tasks = dispatcher.tasks("n1", &session_id).await.unwrap();
        let mut session = dispatcher.session("n1", &session_id).await.unwrap();

        assert!(tasks.recv().await.unwrap().is_ok());
        assert!(session.recv().await.unwrap().is_ok());

        dispatcher.register(spec("n1")).await.unwrap();

        let deadline = Duration::from_secs(5);
        loop {
            match timeout(deadline, tasks.recv()).await.unwrap() {
                Some(Ok(_)) => continue,
                Some(Err(DispatcherError::InvalidSession)) => break,
                other => panic!("unexpected tasks stream end: {other:?}"),
            }
        }
        loop {
            match timeout(deadline, session.recv()).await.unwrap() {
                Some(Ok(_)) => continue,
                Some(Err(DispatcherError::InvalidSession)) => break,
                other => panic!("unexpected session stream end: {other:?}"),
            }
        }
        assert!(tasks.recv().await.is_none());
        assert!(session.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_session_stream_reports_managers() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            store,
            test_config(Duration::from_secs(5), Duration::from_millis(500)),
        );

        let (_, session_id) = dispatcher.register(spec("n1")).await.unwrap();
        let mut stream = dispatcher.session("n1", &session_id).await.unwrap();

        let message = stream.recv().await.unwrap().unwrap();
        assert_eq!(message.managers.len(), 1);
        assert_eq!(message.managers[0].addr, "10.0.0.1:4242");
        assert_eq!(message.managers[0].weight, 1);
        assert!(!message.disconnect);
    }

    #[tokio::test]
    async fn test_update_task_status_writes_through() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            test_config(Duration::from_secs(5), Duration::from_millis(500)),
        );

        store.update(|tx| tx.create_task(task("t1", "n1"))).unwrap();
        let (_, session_id) = dispatcher.register(spec("n1")).await.unwrap();

        dispatcher
            .update_task_status(
                "n1",
                &session_id,
                vec![TaskStatusUpdate {
                    task_id: "t1".to_string(),
                    status: TaskStatus::new(TaskState::Running),
                }],
            )
            .await
            .unwrap();

        let stored = store.view(|tx| tx.get_task("t1")).unwrap();
        assert_eq!(stored.status.state, TaskState::Running);
    }

    #[tokio::test]
    async fn test_cancelled_stream_releases_subscription() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(
            store.clone(),
            test_config(Duration::from_secs(5), Duration::from_millis(500)),
        );

        let (_, session_id) = dispatcher.register(spec("n1")).await.unwrap();
        let mut stream = dispatcher.tasks("n1", &session_id).await.unwrap();
        assert!(stream.recv().await.unwrap().is_ok());

        // Peer cancels; subsequent store traffic must not hang on the
        // abandoned subscription.
        drop(stream);
        for i in 0..64 {
            store
                .update(|tx| tx.create_task(task(&format!("t{i}"), "n1")))
                .unwrap();
        }
    }
}
