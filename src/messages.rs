//! Control-plane records shared by the store, the dispatcher and the
//! certificate lifecycle.

use serde::{Deserialize, Serialize};

/// Role a node plays in the cluster, as encoded in its leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Manager,
    Worker,
}

impl NodeRole {
    /// The organizational unit stamped into leaves for this role.
    pub fn organizational_unit(&self) -> &'static str {
        match self {
            NodeRole::Manager => crate::root_authority::MANAGER_ROLE,
            NodeRole::Worker => crate::root_authority::WORKER_ROLE,
        }
    }

    pub fn from_organizational_unit(ou: &str) -> Option<NodeRole> {
        match ou {
            crate::root_authority::MANAGER_ROLE => Some(NodeRole::Manager),
            crate::root_authority::WORKER_ROLE => Some(NodeRole::Worker),
            _ => None,
        }
    }
}

/// Liveness state tracked for every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unknown,
    Ready,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub state: NodeState,
    #[serde(default)]
    pub message: String,
}

impl NodeStatus {
    pub fn new(state: NodeState) -> Self {
        Self {
            state,
            message: String::new(),
        }
    }
}

/// Progress of a node's certificate issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceState {
    Pending,
    Issued,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCertificate {
    pub state: IssuanceState,
    /// PEM chain, populated once issuance completes.
    #[serde(default)]
    pub issued_chain: Vec<u8>,
}

/// Caller-supplied identity presented at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub role: NodeRole,
}

/// A node row in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub spec: NodeSpec,
    pub status: NodeStatus,
    pub certificate: Option<NodeCertificate>,
}

impl Node {
    pub fn new(spec: NodeSpec) -> Self {
        Self {
            spec,
            status: NodeStatus::new(NodeState::Unknown),
            certificate: None,
        }
    }
}

/// Execution state of a task assigned to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Assigned,
    Preparing,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default)]
    pub message: String,
}

impl TaskStatus {
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            message: String::new(),
        }
    }
}

/// A task row in the store, scoped to the node it is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub node_id: String,
    pub status: TaskStatus,
}

/// One status update reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: String,
    pub status: TaskStatus,
}

/// Full current task set for a node. A task missing from the list is to
/// be terminated by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TasksMessage {
    pub tasks: Vec<Task>,
}

/// A manager peer an agent may connect to, with a selection weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedPeer {
    pub addr: String,
    pub weight: u64,
}

/// Periodic connection-control message on the session stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub managers: Vec<WeightedPeer>,
    /// When set, the peer should drop the connection and re-connect to
    /// another manager.
    pub disconnect: bool,
}

/// Cluster-wide settings consulted by the certificate lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// When set, manager keys at rest are encrypted under `unlock_key`.
    pub auto_lock_managers: bool,
    #[serde(default)]
    pub unlock_key: Option<Vec<u8>>,
}
