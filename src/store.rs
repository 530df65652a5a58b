//! In-memory watchable store backing the dispatcher and the certificate
//! lifecycle.
//!
//! Mutations run inside closure transactions: either every operation in
//! the closure lands and its change events are published, or none do.
//! Reads run against a consistent snapshot under the same lock.

use crate::error::StoreError;
use crate::messages::{ClusterInfo, Node, Task};
use crate::watch::WatchQueue;
use std::collections::HashMap;
use std::sync::RwLock;

/// One committed change, as delivered to watch subscribers.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    CreateNode(Node),
    UpdateNode(Node),
    DeleteNode(Node),
    CreateTask(Task),
    UpdateTask(Task),
    DeleteTask(Task),
    UpdateCluster(ClusterInfo),
}

#[derive(Default, Clone)]
struct Tables {
    nodes: HashMap<String, Node>,
    tasks: HashMap<String, Task>,
    cluster: ClusterInfo,
}

/// Mutable transaction handle passed to [`MemoryStore::update`] closures.
pub struct Tx<'a> {
    tables: &'a mut Tables,
    events: Vec<StoreEvent>,
}

impl Tx<'_> {
    pub fn create_node(&mut self, node: Node) -> Result<(), StoreError> {
        if self.tables.nodes.contains_key(&node.spec.id) {
            return Err(StoreError::Exist);
        }
        self.events.push(StoreEvent::CreateNode(node.clone()));
        self.tables.nodes.insert(node.spec.id.clone(), node);
        Ok(())
    }

    pub fn update_node(&mut self, node: Node) -> Result<(), StoreError> {
        if !self.tables.nodes.contains_key(&node.spec.id) {
            return Err(StoreError::NotFound);
        }
        self.events.push(StoreEvent::UpdateNode(node.clone()));
        self.tables.nodes.insert(node.spec.id.clone(), node);
        Ok(())
    }

    /// Create the node or, when it already exists, update it in place.
    pub fn create_or_update_node(&mut self, node: Node) -> Result<(), StoreError> {
        match self.create_node(node.clone()) {
            Err(StoreError::Exist) => self.update_node(node),
            other => other,
        }
    }

    pub fn delete_node(&mut self, id: &str) -> Result<(), StoreError> {
        match self.tables.nodes.remove(id) {
            Some(node) => {
                self.events.push(StoreEvent::DeleteNode(node));
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.tables.nodes.get(id).cloned()
    }

    pub fn create_task(&mut self, task: Task) -> Result<(), StoreError> {
        if self.tables.tasks.contains_key(&task.id) {
            return Err(StoreError::Exist);
        }
        self.events.push(StoreEvent::CreateTask(task.clone()));
        self.tables.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn update_task(&mut self, task: Task) -> Result<(), StoreError> {
        if !self.tables.tasks.contains_key(&task.id) {
            return Err(StoreError::NotFound);
        }
        self.events.push(StoreEvent::UpdateTask(task.clone()));
        self.tables.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn delete_task(&mut self, id: &str) -> Result<(), StoreError> {
        match self.tables.tasks.remove(id) {
            Some(task) => {
                self.events.push(StoreEvent::DeleteTask(task));
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.tables.tasks.get(id).cloned()
    }

    pub fn update_cluster(&mut self, cluster: ClusterInfo) {
        self.events.push(StoreEvent::UpdateCluster(cluster.clone()));
        self.tables.cluster = cluster;
    }
}

/// Read transaction handle passed to [`MemoryStore::view`] closures.
pub struct ReadTx<'a> {
    tables: &'a Tables,
}

impl ReadTx<'_> {
    pub fn get_node(&self, id: &str) -> Option<Node> {
        self.tables.nodes.get(id).cloned()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.tables.nodes.values().cloned().collect()
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.tables.tasks.get(id).cloned()
    }

    pub fn tasks_by_node(&self, node_id: &str) -> Vec<Task> {
        self.tables
            .tasks
            .values()
            .filter(|t| t.node_id == node_id)
            .cloned()
            .collect()
    }

    pub fn cluster(&self) -> ClusterInfo {
        self.tables.cluster.clone()
    }
}

/// The watchable in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    watch_queue: WatchQueue,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch_queue(&self) -> &WatchQueue {
        &self.watch_queue
    }

    /// Run a mutating transaction. The closure operates on a scratch copy
    /// of the tables: on error nothing is committed and no events are
    /// published.
    pub fn update<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Tx<'_>) -> Result<(), StoreError>,
    {
        let mut tables = self.tables.write().unwrap();
        let mut scratch = tables.clone();
        let mut tx = Tx {
            tables: &mut scratch,
            events: Vec::new(),
        };
        f(&mut tx)?;
        let events = tx.events;
        *tables = scratch;
        // Published under the table lock so subscribers observe events in
        // commit order.
        for event in &events {
            self.watch_queue.publish(event);
        }
        Ok(())
    }

    /// Run a read-only transaction over a consistent snapshot.
    pub fn view<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&ReadTx<'_>) -> R,
    {
        let tables = self.tables.read().unwrap();
        f(&ReadTx { tables: &tables })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{NodeRole, NodeSpec, TaskState, TaskStatus};
    use std::sync::Arc;

    fn node(id: &str) -> Node {
        Node::new(NodeSpec {
            id: id.to_string(),
            role: NodeRole::Worker,
        })
    }

    fn task(id: &str, node_id: &str) -> Task {
        Task {
            id: id.to_string(),
            node_id: node_id.to_string(),
            status: TaskStatus::new(TaskState::Assigned),
        }
    }

    #[test]
    fn test_create_update_delete() {
        let store = MemoryStore::new();

        store.update(|tx| tx.create_node(node("n1"))).unwrap();
        assert_eq!(
            store.update(|tx| tx.create_node(node("n1"))),
            Err(StoreError::Exist)
        );
        assert_eq!(
            store.update(|tx| tx.update_node(node("n2"))),
            Err(StoreError::NotFound)
        );

        store.update(|tx| tx.create_or_update_node(node("n1"))).unwrap();
        store.update(|tx| tx.create_or_update_node(node("n2"))).unwrap();
        assert_eq!(store.view(|tx| tx.nodes()).len(), 2);

        store.update(|tx| tx.delete_node("n1")).unwrap();
        assert!(store.view(|tx| tx.get_node("n1")).is_none());
    }

    #[test]
    fn test_failed_transaction_commits_nothing() {
        let store = MemoryStore::new();
        let result = store.update(|tx| {
            tx.create_node(node("n1"))?;
            Err(StoreError::NotFound)
        });
        assert_eq!(result, Err(StoreError::NotFound));
        assert!(store.view(|tx| tx.get_node("n1")).is_none());
    }

    #[test]
    fn test_tasks_by_node() {
        let store = MemoryStore::new();
        store
            .update(|tx| {
                tx.create_task(task("t1", "n1"))?;
                tx.create_task(task("t2", "n2"))?;
                tx.create_task(task("t3", "n1"))
            })
            .unwrap();

        let mut ids: Vec<_> = store
            .view(|tx| tx.tasks_by_node("n1"))
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["t1", "t3"]);
    }

    #[tokio::test]
    async fn test_events_follow_commit() {
        let store = MemoryStore::new();
        let mut rx = store.watch_queue().watch(Arc::new(|_| true));

        // A failed transaction publishes nothing.
        let _ = store.update(|tx| {
            tx.create_task(task("t0", "n1"))?;
            Err(StoreError::Exist)
        });

        store
            .update(|tx| {
                tx.create_task(task("t1", "n1"))?;
                tx.delete_task("t1")
            })
            .unwrap();

        match rx.recv().await.unwrap() {
            StoreEvent::CreateTask(t) => assert_eq!(t.id, "t1"),
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            StoreEvent::DeleteTask(t) => assert_eq!(t.id, "t1"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
