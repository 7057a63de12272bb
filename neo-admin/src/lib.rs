//! Admin operations (§6): thin request/response calls against the primary
//! master over the dispatcher, not a CLI front end — `neo`'s admin role
//! binary wraps this in whatever interactive shell it wants.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use neo_base::{err, Result};
use neo_dispatch::Dispatcher;
use neo_proto::{
    AskAddPendingNodes, AskCheckReplicas, AskClusterState, AskDropNode, AskNodeList, AskPartitionList, AskPrimary,
    AskSetNodeState, AskTweakPartitionTable, ClusterState, Frame, NodeInfo, NodeState, Packet, PartitionTable,
    PartitionTableDelta, SetClusterState, Tid, Uuid,
};
use neo_wire::ConnHandle;

/// A divergent partition and the UUID it was compared against, returned
/// by `check_replicas` (§4.4 "Partition-table integrity checks").
pub struct Divergence {
    pub partition: u32,
}

/// Talks to one primary master connection. Callers re-create this after a
/// primary-failure re-bootstrap (§7 "Primary failure").
pub struct AdminClient {
    master: ConnHandle,
    dispatcher: Dispatcher,
    next_id: AtomicU32,
    timeout: Duration,
}

impl AdminClient {
    pub fn new(master: ConnHandle, dispatcher: Dispatcher, timeout: Duration) -> AdminClient {
        AdminClient { master, dispatcher, next_id: AtomicU32::new(1), timeout }
    }

    fn call(&self, packet: Packet) -> Result<Packet> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.dispatcher.register(self.master.token, id);
        self.master.send(&Frame::new(id, packet))?;
        match self.dispatcher.wait(id, receiver, self.timeout) {
            Some(frame) => match frame.packet {
                Packet::Error(e) => Err(err(e.message)),
                other => Ok(other),
            },
            None => Err(err("admin request timed out or the master connection was lost")),
        }
    }

    pub fn get_partition_rows(&self) -> Result<PartitionTable> {
        match self.call(Packet::AskPartitionList(AskPartitionList))? {
            Packet::AnswerPartitionList(a) => Ok(a.table),
            _ => Err(err("unexpected answer to AskPartitionList")),
        }
    }

    pub fn get_node_list(&self) -> Result<Vec<NodeInfo>> {
        match self.call(Packet::AskNodeList(AskNodeList))? {
            Packet::AnswerNodeList(a) => Ok(a.nodes),
            _ => Err(err("unexpected answer to AskNodeList")),
        }
    }

    pub fn get_cluster_state(&self) -> Result<ClusterState> {
        match self.call(Packet::AskClusterState(AskClusterState))? {
            Packet::AnswerClusterState(a) => Ok(a.state),
            _ => Err(err("unexpected answer to AskClusterState")),
        }
    }

    pub fn set_cluster_state(&self, state: ClusterState) -> Result<ClusterState> {
        match self.call(Packet::SetClusterState(SetClusterState { state }))? {
            Packet::AnswerClusterState(a) => Ok(a.state),
            _ => Err(err("unexpected answer to SetClusterState")),
        }
    }

    pub fn set_node_state(&self, uuid: Uuid, state: NodeState, modify_pt: bool) -> Result<Uuid> {
        let packet = Packet::AskSetNodeState(AskSetNodeState { uuid, state, modify_partition_table: modify_pt });
        match self.call(packet)? {
            Packet::AnswerSetNodeState(a) => Ok(a.uuid),
            _ => Err(err("unexpected answer to AskSetNodeState")),
        }
    }

    pub fn add_pending_nodes(&self, uuids: Vec<Uuid>) -> Result<Vec<Uuid>> {
        match self.call(Packet::AskAddPendingNodes(AskAddPendingNodes { uuids }))? {
            Packet::AnswerAddPendingNodes(a) => Ok(a.added),
            _ => Err(err("unexpected answer to AskAddPendingNodes")),
        }
    }

    pub fn tweak_partition_table(&self, excluded: Vec<Uuid>) -> Result<PartitionTableDelta> {
        match self.call(Packet::AskTweakPartitionTable(AskTweakPartitionTable { excluded }))? {
            Packet::AnswerTweakPartitionTable(a) => Ok(a.delta),
            _ => Err(err("unexpected answer to AskTweakPartitionTable")),
        }
    }

    pub fn drop_node(&self, uuid: Uuid) -> Result<Uuid> {
        match self.call(Packet::AskDropNode(AskDropNode { uuid }))? {
            Packet::AnswerDropNode(a) => Ok(a.uuid),
            _ => Err(err("unexpected answer to AskDropNode")),
        }
    }

    pub fn check_replicas(&self, partition_sources: Vec<(u32, Uuid)>, min_tid: Tid, max_tid: Tid) -> Result<Vec<Divergence>> {
        let packet = Packet::AskCheckReplicas(AskCheckReplicas { partition_sources, min_tid, max_tid });
        match self.call(packet)? {
            Packet::AnswerCheckReplicas(a) => Ok(a.divergent_partitions.into_iter().map(|partition| Divergence { partition }).collect()),
            _ => Err(err("unexpected answer to AskCheckReplicas")),
        }
    }

    pub fn get_primary(&self) -> Result<Option<Uuid>> {
        match self.call(Packet::AskPrimary(AskPrimary))? {
            Packet::AnswerPrimary(a) => Ok(a.primary),
            _ => Err(err("unexpected answer to AskPrimary")),
        }
    }
}
