//! Master role glue (§4.1, §4.2): binds the state machines in `neo-master`
//! to live connections via a `neo-dispatch` [`Handler`]. One process always
//! runs as primary here — `neo_master::Election`'s multi-master
//! negotiation loop is exercised by its own unit tests but not dialed into
//! this binary's serving loop (a documented scope cut, see DESIGN.md).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::Token;
use rand::Rng;

use neo_base::Result;
use neo_dispatch::{Action, DispatchTable, Handler};
use neo_master::{Allocator, Assigner, ClusterStateMachine, Coordinator, NodeManager};
use neo_proto::{
    AcceptIdentification, AnswerAbortTransaction, AnswerAddPendingNodes, AnswerBeginTransaction,
    AnswerCheckReplicas, AnswerCheckSerialRange, AnswerCheckTidRange, AnswerClusterState, AnswerDropNode,
    AnswerFinishTransaction, AnswerInformationLocked, AnswerNewOids, AnswerNodeList, AnswerPartitionList,
    AnswerPrimary, AnswerSetNodeState, AnswerTweakPartitionTable, AskCheckSerialRange, AskCheckTidRange,
    AskLockInformation, ClusterState, Frame, InvalidateObjects, NodeInfo, NodeRole, NodeState,
    NotifyClusterInformation, NotifyPartitionChanges, NotifyUnlockInformation, Packet, PartitionTable,
    SendPartitionTable, Tid, Uuid,
};
use neo_wire::EventLoop;

fn random_uuid(role: NodeRole) -> Uuid {
    let mut entropy = [0u8; 15];
    rand::thread_rng().fill(&mut entropy);
    Uuid::new(role, entropy)
}

/// One partition's pairwise comparison within an in-flight `checkReplicas`
/// fan-out: the reference replica named by the admin call, plus (if the
/// partition table has one) a second up-to-date replica to compare it
/// against. Full N-way comparison across every replica is future work;
/// pairwise already catches the common "one replica drifted" case.
struct PartitionCheck {
    peer_a: Uuid,
    peer_b: Option<Uuid>,
    tid: HashMap<Uuid, (u64, [u8; 20])>,
    serial: HashMap<Uuid, (u64, [u8; 20])>,
}

struct CheckJob {
    admin_token: Token,
    admin_req_id: u32,
    partitions: HashMap<u32, PartitionCheck>,
    awaiting: usize,
}

/// Cluster state mutated by every connection's handler (§9 "Cyclic
/// references": the state owns nodes by UUID; connections are referred to
/// only by `Token`, resolved through the event loop when a frame must
/// actually go out).
struct MasterState {
    self_uuid: Uuid,
    csm: ClusterStateMachine,
    nodes: NodeManager,
    table: PartitionTable,
    coordinator: Coordinator,
    token_uuid: HashMap<Token, Uuid>,
    uuid_token: HashMap<Uuid, Token>,
    pending_finish: HashMap<Tid, (Token, u32)>,
    pending_checks: HashMap<u32, CheckJob>,
    in_flight_checks: HashMap<u32, (u32, u32, Uuid, bool)>,
    next_check_id: u32,
    pending_sends: Vec<(Token, Frame)>,
    next_server_id: u32,
}

impl MasterState {
    fn alloc_id(&mut self) -> u32 {
        self.next_server_id = self.next_server_id.wrapping_add(1);
        self.next_server_id
    }

    fn send_to(&mut self, uuid: Uuid, frame: Frame) {
        if let Some(&token) = self.uuid_token.get(&uuid) {
            self.pending_sends.push((token, frame));
        }
    }

    fn broadcast_nodes(&mut self) {
        let nodes = self.nodes.snapshot();
        let tokens: Vec<Token> = self.token_uuid.keys().copied().collect();
        for token in tokens {
            self.pending_sends
                .push((token, Frame::new(self.alloc_id(), Packet::NotifyNodeInformation(neo_proto::NotifyNodeInformation { nodes: nodes.clone() }))));
        }
    }

    fn broadcast_cluster_state(&mut self, state: ClusterState) {
        let tokens: Vec<Token> = self.token_uuid.keys().copied().collect();
        for token in tokens {
            let id = self.alloc_id();
            self.pending_sends.push((token, Frame::new(id, Packet::NotifyClusterInformation(NotifyClusterInformation { state }))));
        }
    }

    fn broadcast_pt_delta(&mut self, delta: neo_proto::PartitionTableDelta) {
        let tokens: Vec<Token> = self.token_uuid.keys().copied().collect();
        for token in tokens {
            let id = self.alloc_id();
            self.pending_sends
                .push((token, Frame::new(id, Packet::NotifyPartitionChanges(NotifyPartitionChanges { delta: delta.clone() }))));
        }
    }

    fn client_tokens(&self) -> Vec<Token> {
        self.token_uuid
            .iter()
            .filter(|(_, uuid)| uuid.role() == Some(NodeRole::Client))
            .map(|(token, _)| *token)
            .collect()
    }
}

/// The lone phase every connection stays in for this exercise's master:
/// identification is just the first frame, not a handler switch, since the
/// master must keep handling membership/2PC traffic from the same peer
/// afterward.
struct MasterHandler {
    shared: Arc<Mutex<MasterState>>,
    cluster_name: String,
}

impl Handler for MasterHandler {
    fn name(&self) -> &'static str {
        "master"
    }

    fn on_frame(&mut self, token: Token, frame: Frame, outbox: &mut Vec<Frame>) -> Action {
        let id = frame.id;
        let mut state = self.shared.lock().unwrap();
        match frame.packet {
            Packet::RequestIdentification(req) => {
                if req.cluster_name != self.cluster_name {
                    return Action::ProtocolError("cluster name does not match this cluster");
                }
                state.token_uuid.insert(token, req.uuid);
                state.uuid_token.insert(req.uuid, token);
                state.nodes.upsert(NodeInfo {
                    uuid: req.uuid,
                    role: req.uuid.role().unwrap_or(NodeRole::Client),
                    address: req.address,
                    state: NodeState::Running,
                });
                outbox.push(Frame::new(
                    id,
                    Packet::AcceptIdentification(AcceptIdentification {
                        your_uuid: req.uuid,
                        num_partitions: state.table.num_partitions,
                        num_replicas: state.table.num_replicas,
                    }),
                ));
                let table = state.table.clone();
                outbox.push(Frame::new(state.alloc_id(), Packet::SendPartitionTable(SendPartitionTable { table })));
                state.broadcast_nodes();
                Action::Continue
            }

            Packet::AskPrimary(_) => {
                outbox.push(Frame::new(
                    id,
                    Packet::AnswerPrimary(AnswerPrimary { primary: Some(state.self_uuid), known_masters: Vec::new() }),
                ));
                Action::Continue
            }

            Packet::AskClusterState(_) => {
                let current = state.csm.current();
                outbox.push(Frame::new(id, Packet::AnswerClusterState(AnswerClusterState { state: current })));
                Action::Continue
            }
            Packet::SetClusterState(req) => match state.csm.transition_to(req.state) {
                Ok(()) => {
                    outbox.push(Frame::new(id, Packet::AnswerClusterState(AnswerClusterState { state: req.state })));
                    state.broadcast_cluster_state(req.state);
                    Action::Continue
                }
                Err(_) => Action::ProtocolError("illegal cluster state transition"),
            },

            Packet::AskNodeList(_) => {
                outbox.push(Frame::new(id, Packet::AnswerNodeList(AnswerNodeList { nodes: state.nodes.snapshot() })));
                Action::Continue
            }
            Packet::AskPartitionList(_) => {
                outbox.push(Frame::new(id, Packet::AnswerPartitionList(AnswerPartitionList { table: state.table.clone() })));
                Action::Continue
            }
            Packet::AskSetNodeState(req) => {
                state.nodes.set_state(req.uuid, req.state);
                if req.modify_partition_table && req.state != NodeState::Running {
                    let delta = Assigner::new(&state.table).drop_node(req.uuid);
                    state.table.apply_delta(&delta);
                    state.broadcast_pt_delta(delta);
                }
                outbox.push(Frame::new(id, Packet::AnswerSetNodeState(AnswerSetNodeState { uuid: req.uuid })));
                state.broadcast_nodes();
                Action::Continue
            }
            Packet::AskAddPendingNodes(req) => {
                for uuid in &req.uuids {
                    state.nodes.upsert(NodeInfo { uuid: *uuid, role: uuid.role().unwrap_or(NodeRole::Storage), address: None, state: NodeState::Pending });
                }
                outbox.push(Frame::new(id, Packet::AnswerAddPendingNodes(AnswerAddPendingNodes { added: req.uuids })));
                Action::Continue
            }
            Packet::AskTweakPartitionTable(req) => {
                let eligible: Vec<Uuid> = state
                    .nodes
                    .by_role(NodeRole::Storage)
                    .map(|n| n.uuid)
                    .filter(|u| !req.excluded.contains(u))
                    .collect();
                let delta = Assigner::new(&state.table).tweak(&eligible);
                state.table.apply_delta(&delta);
                outbox.push(Frame::new(id, Packet::AnswerTweakPartitionTable(AnswerTweakPartitionTable { delta: delta.clone() })));
                state.broadcast_pt_delta(delta);
                Action::Continue
            }
            Packet::AskDropNode(req) => {
                let delta = Assigner::new(&state.table).drop_node(req.uuid);
                state.table.apply_delta(&delta);
                state.nodes.remove(req.uuid);
                if let Some(dead_token) = state.uuid_token.remove(&req.uuid) {
                    state.token_uuid.remove(&dead_token);
                }
                outbox.push(Frame::new(id, Packet::AnswerDropNode(AnswerDropNode { uuid: req.uuid })));
                state.broadcast_pt_delta(delta);
                state.broadcast_nodes();
                Action::Continue
            }

            Packet::AskBeginTransaction(_) => {
                let tid = state.coordinator.begin(neo_proto::tid::now());
                outbox.push(Frame::new(id, Packet::AnswerBeginTransaction(AnswerBeginTransaction { tid })));
                Action::Continue
            }
            Packet::AskNewOids(req) => {
                let oids = state.coordinator.new_oids(req.count);
                outbox.push(Frame::new(id, Packet::AnswerNewOids(AnswerNewOids { oids })));
                Action::Continue
            }
            Packet::AskFinishTransaction(req) => {
                state.pending_finish.insert(req.tid, (token, id));
                let table = state.table.clone();
                let storages = state.coordinator.prepare(req.tid, req.oids.clone(), &table);
                for uuid in storages {
                    let sid = state.alloc_id();
                    let frame = Frame::new(sid, Packet::AskLockInformation(AskLockInformation { tid: req.tid, oids: req.oids.clone() }));
                    state.send_to(uuid, frame);
                }
                Action::Continue
            }
            Packet::AskAbortTransaction(req) => {
                let storages = state.coordinator.abort(req.tid);
                for uuid in storages {
                    let sid = state.alloc_id();
                    let frame = Frame::new(sid, Packet::NotifyUnlockInformation(NotifyUnlockInformation { tid: req.tid, commit: false }));
                    state.send_to(uuid, frame);
                }
                outbox.push(Frame::new(id, Packet::AnswerAbortTransaction(AnswerAbortTransaction { tid: req.tid })));
                Action::Continue
            }
            Packet::AnswerInformationLocked(ans) => {
                if let Some(uuid) = state.token_uuid.get(&token).copied() {
                    if state.coordinator.on_lock_ack(ans.tid, uuid) {
                        if let Some((oids, notify)) = state.coordinator.finish(ans.tid) {
                            for nuuid in notify {
                                let sid = state.alloc_id();
                                let frame = Frame::new(sid, Packet::NotifyUnlockInformation(NotifyUnlockInformation { tid: ans.tid, commit: true }));
                                state.send_to(nuuid, frame);
                            }
                            for ctoken in state.client_tokens() {
                                let sid = state.alloc_id();
                                let frame = Frame::new(sid, Packet::InvalidateObjects(InvalidateObjects { tid: ans.tid, oids: oids.clone() }));
                                state.pending_sends.push((ctoken, frame));
                            }
                            if let Some((ctoken, creq)) = state.pending_finish.remove(&ans.tid) {
                                state.pending_sends.push((ctoken, Frame::new(creq, Packet::AnswerFinishTransaction(AnswerFinishTransaction { tid: ans.tid }))));
                            }
                        }
                    }
                }
                Action::Continue
            }

            Packet::AskCheckReplicas(req) => {
                let check_id = state.next_check_id;
                state.next_check_id = state.next_check_id.wrapping_add(1);
                let mut partitions = HashMap::new();
                let mut requests: Vec<(u32, Uuid, bool, u32)> = Vec::new();
                for (partition, reference) in &req.partition_sources {
                    let peer_b = state
                        .table
                        .readable_cells(*partition)
                        .map(|c| c.node)
                        .find(|n| n != reference);
                    partitions.insert(*partition, PartitionCheck { peer_a: *reference, peer_b, tid: HashMap::new(), serial: HashMap::new() });
                    for peer in std::iter::once(*reference).chain(peer_b) {
                        let tid_id = state.alloc_id();
                        requests.push((*partition, peer, false, tid_id));
                        let serial_id = state.alloc_id();
                        requests.push((*partition, peer, true, serial_id));
                    }
                }
                let awaiting = requests.len();
                for (partition, peer, is_serial, req_id) in requests {
                    state.in_flight_checks.insert(req_id, (check_id, partition, peer, is_serial));
                    let packet = if is_serial {
                        Packet::AskCheckSerialRange(AskCheckSerialRange { partition, min_tid: req.min_tid, max_tid: req.max_tid })
                    } else {
                        Packet::AskCheckTidRange(AskCheckTidRange { partition, min_tid: req.min_tid, max_tid: req.max_tid })
                    };
                    state.send_to(peer, Frame::new(req_id, packet));
                }
                state.pending_checks.insert(check_id, CheckJob { admin_token: token, admin_req_id: id, partitions, awaiting });
                if awaiting == 0 {
                    finalize_check(&mut state, check_id);
                }
                Action::Continue
            }
            Packet::AnswerCheckTidRange(ans) => {
                if let Some((check_id, partition, peer, _)) = state.in_flight_checks.remove(&id) {
                    if let Some(job) = state.pending_checks.get_mut(&check_id) {
                        if let Some(pc) = job.partitions.get_mut(&partition) {
                            pc.tid.insert(peer, (ans.count, ans.hash));
                        }
                        job.awaiting = job.awaiting.saturating_sub(1);
                        if job.awaiting == 0 {
                            finalize_check(&mut state, check_id);
                        }
                    }
                }
                Action::Continue
            }
            Packet::AnswerCheckSerialRange(ans) => {
                if let Some((check_id, partition, peer, _)) = state.in_flight_checks.remove(&id) {
                    if let Some(job) = state.pending_checks.get_mut(&check_id) {
                        if let Some(pc) = job.partitions.get_mut(&partition) {
                            pc.serial.insert(peer, (ans.count, ans.hash));
                        }
                        job.awaiting = job.awaiting.saturating_sub(1);
                        if job.awaiting == 0 {
                            finalize_check(&mut state, check_id);
                        }
                    }
                }
                Action::Continue
            }

            Packet::NotifyUnlockInformation(_)
            | Packet::AskLockInformation(_)
            | Packet::AskObject(_)
            | Packet::AskStoreObject(_)
            | Packet::AskObjectHistory(_)
            | Packet::AskUndoTransaction(_)
            | Packet::AskPack(_) => Action::ProtocolError("object-I/O packets belong on a storage connection, not the master"),

            _ => Action::ProtocolError("unexpected packet in master phase"),
        }
    }
}

fn finalize_check(state: &mut MasterState, check_id: u32) {
    let job = match state.pending_checks.remove(&check_id) {
        Some(job) => job,
        None => return,
    };
    let mut divergent = Vec::new();
    for (partition, pc) in &job.partitions {
        if let Some(peer_b) = pc.peer_b {
            let a_tid = pc.tid.get(&pc.peer_a);
            let b_tid = pc.tid.get(&peer_b);
            let a_serial = pc.serial.get(&pc.peer_a);
            let b_serial = pc.serial.get(&peer_b);
            let tids_differ = matches!((a_tid, b_tid), (Some(a), Some(b)) if a != b);
            let serials_differ = matches!((a_serial, b_serial), (Some(a), Some(b)) if a != b);
            if tids_differ || serials_differ {
                divergent.push(*partition);
            }
        }
    }
    state
        .pending_sends
        .push((job.admin_token, Frame::new(job.admin_req_id, Packet::AnswerCheckReplicas(AnswerCheckReplicas { divergent_partitions: divergent }))));
}

/// Runs the master role until the process is killed. Always serves as
/// primary (see module docs).
pub fn run_master(cluster_name: String, bind: SocketAddr, num_partitions: u32, num_replicas: u32) -> Result<()> {
    let self_uuid = random_uuid(NodeRole::Master);
    tracing::info!(?self_uuid, %bind, "starting master");

    let shared = Arc::new(Mutex::new(MasterState {
        self_uuid,
        csm: ClusterStateMachine::new(),
        nodes: NodeManager::new(),
        table: PartitionTable::new(num_partitions, num_replicas),
        coordinator: Coordinator::new(Allocator::new(Tid::ZERO, 1)),
        token_uuid: HashMap::new(),
        uuid_token: HashMap::new(),
        pending_finish: HashMap::new(),
        pending_checks: HashMap::new(),
        in_flight_checks: HashMap::new(),
        next_check_id: 0,
        pending_sends: Vec::new(),
        next_server_id: 1,
    }));

    let mut event_loop = EventLoop::bind(bind)?;
    let mut sink = ServerSink { shared: shared.clone(), cluster_name, conns: HashMap::new(), dead: Vec::new() };

    loop {
        event_loop.turn(Some(Duration::from_millis(200)), &mut sink)?;
        let pending: Vec<(Token, Frame)> = { std::mem::take(&mut shared.lock().unwrap().pending_sends) };
        for (token, frame) in pending {
            if let Some(handle) = event_loop.handle(token) {
                let _ = handle.send(&frame);
            }
        }
        for token in sink.dead.drain(..) {
            let mut state = shared.lock().unwrap();
            if let Some(uuid) = state.token_uuid.remove(&token) {
                state.uuid_token.remove(&uuid);
                state.nodes.set_state(uuid, NodeState::Down);
                let unblocked = state.coordinator.forget(uuid);
                for tid in unblocked {
                    if let Some((oids, notify)) = state.coordinator.finish(tid) {
                        for nuuid in notify {
                            let sid = state.alloc_id();
                            state.send_to(nuuid, Frame::new(sid, Packet::NotifyUnlockInformation(NotifyUnlockInformation { tid, commit: true })));
                        }
                        if let Some((ctoken, creq)) = state.pending_finish.remove(&tid) {
                            state.pending_sends.push((ctoken, Frame::new(creq, Packet::AnswerFinishTransaction(AnswerFinishTransaction { tid }))));
                        }
                        let _ = oids;
                    }
                }
                state.broadcast_nodes();
            }
        }
    }
}

/// Adapts [`neo_wire::Transport`] to the per-connection [`Handler`]/
/// [`DispatchTable`] model: every connection gets its own `MasterHandler`
/// wrapping the same shared state. `turn()` drives this from a single
/// thread, so the connection table needs no locking of its own.
struct ServerSink {
    shared: Arc<Mutex<MasterState>>,
    cluster_name: String,
    conns: HashMap<Token, DispatchTable>,
    dead: Vec<Token>,
}

impl neo_wire::Transport for ServerSink {
    fn on_accept(&mut self, token: Token, peer: SocketAddr) {
        tracing::debug!(?token, %peer, "master accepted connection");
        let handler = MasterHandler { shared: self.shared.clone(), cluster_name: self.cluster_name.clone() };
        self.conns.insert(token, DispatchTable::new(Box::new(handler)));
    }

    fn on_connect(&mut self, _token: Token) {}

    fn on_frame(&mut self, token: Token, frame: Frame) {
        if let Some(table) = self.conns.get_mut(&token) {
            let mut outbox = Vec::new();
            if let Err(e) = table.dispatch(token, frame, &mut outbox) {
                tracing::warn!(?token, error = %e, "master connection protocol error");
            }
            let mut state = self.shared.lock().unwrap();
            for frame in outbox {
                state.pending_sends.push((token, frame));
            }
        }
    }

    fn on_closed(&mut self, token: Token) {
        self.conns.remove(&token);
        self.dead.push(token);
    }

    fn on_error(&mut self, token: Token, error: neo_base::Error) {
        tracing::warn!(?token, %error, "master connection error");
    }
}
