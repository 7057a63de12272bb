use crate::{NodeRole, Uuid};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Liveness/role state of a node as tracked by the node manager (§3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Running,
    TemporarilyDown,
    Down,
    Broken,
    Hidden,
    Pending,
    Unknown,
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState::Unknown
    }
}

/// One row of a `NotifyNodeInformation` broadcast: a self-consistent
/// snapshot of a single node's identity and current state.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub uuid: Uuid,
    pub role: NodeRole,
    pub address: Option<SocketAddr>,
    pub state: NodeState,
}
