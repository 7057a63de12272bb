use std::collections::BTreeMap;
use std::net::SocketAddr;

use neo_proto::{NodeInfo, NodeRole, NodeState, Uuid};

/// The authoritative set of known peers, keyed by UUID and by address
/// (§2 shared substrate item 5, §4.1 "Membership"). Connections carry only
/// a UUID; this is the single place that owns the node records themselves
/// (§9 "Cyclic references": the node manager owns `Node`, the event loop
/// owns `Connection`, each side refers to the other by id).
#[derive(Default)]
pub struct NodeManager {
    by_uuid: BTreeMap<Uuid, NodeInfo>,
    by_address: BTreeMap<SocketAddr, Uuid>,
}

impl NodeManager {
    pub fn new() -> NodeManager {
        NodeManager::default()
    }

    /// Inserts or replaces a node record. Returns the previous record, if
    /// any existed under the same UUID.
    pub fn upsert(&mut self, info: NodeInfo) -> Option<NodeInfo> {
        if let Some(addr) = info.address {
            self.by_address.insert(addr, info.uuid);
        }
        self.by_uuid.insert(info.uuid, info)
    }

    pub fn get(&self, uuid: Uuid) -> Option<&NodeInfo> {
        self.by_uuid.get(&uuid)
    }

    pub fn get_by_address(&self, addr: SocketAddr) -> Option<&NodeInfo> {
        self.by_address.get(&addr).and_then(|uuid| self.by_uuid.get(uuid))
    }

    pub fn set_state(&mut self, uuid: Uuid, state: NodeState) -> bool {
        match self.by_uuid.get_mut(&uuid) {
            Some(info) => {
                info.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, uuid: Uuid) -> Option<NodeInfo> {
        let removed = self.by_uuid.remove(&uuid);
        if let Some(info) = &removed {
            if let Some(addr) = info.address {
                self.by_address.remove(&addr);
            }
        }
        removed
    }

    pub fn by_role(&self, role: NodeRole) -> impl Iterator<Item = &NodeInfo> {
        self.by_uuid.values().filter(move |n| n.role == role)
    }

    pub fn storages_in_state(&self, state: NodeState) -> impl Iterator<Item = &NodeInfo> {
        self.by_role(NodeRole::Storage).filter(move |n| n.state == state)
    }

    /// A self-consistent snapshot suitable for a `NotifyNodeInformation`
    /// broadcast (§4.1: "Each broadcast is self-consistent").
    pub fn snapshot(&self) -> Vec<NodeInfo> {
        self.by_uuid.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn node(n: u8, state: NodeState) -> NodeInfo {
        NodeInfo {
            uuid: Uuid::new(NodeRole::Storage, [n; 15]),
            role: NodeRole::Storage,
            address: None,
            state,
        }
    }

    #[test]
    fn upsert_and_lookup_round_trips() {
        let mut nm = NodeManager::new();
        let n = node(1, NodeState::Running);
        nm.upsert(n.clone());
        assert_eq!(nm.get(n.uuid).unwrap().state, NodeState::Running);
    }

    #[test]
    fn removing_a_node_clears_its_address_index() {
        let mut nm = NodeManager::new();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let mut n = node(1, NodeState::Running);
        n.address = Some(addr);
        nm.upsert(n.clone());
        assert!(nm.get_by_address(addr).is_some());
        nm.remove(n.uuid);
        assert!(nm.get_by_address(addr).is_none());
    }

    #[test]
    fn storages_in_state_filters_by_role_and_state() {
        let mut nm = NodeManager::new();
        nm.upsert(node(1, NodeState::Running));
        nm.upsert(node(2, NodeState::Pending));
        let running: Vec<_> = nm.storages_in_state(NodeState::Running).collect();
        assert_eq!(running.len(), 1);
    }
}
