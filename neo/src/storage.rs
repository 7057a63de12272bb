//! Storage role glue (§4.4): answers object I/O, 2PC lock/unlock, pack,
//! undo, and the replication/integrity-check packets against a local
//! [`neo_storage::Engine`]. Only the *server* side of replication is wired
//! here — a storage answers `AskTidsFrom`/`AskOidsFrom`/etc. from its own
//! engine, but this binary doesn't drive a live catch-up loop against a
//! peer (see DESIGN.md): `neo_storage::Replicator` is exercised by its own
//! tests, not dialed into the event loop.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::Token;
use rand::Rng;
use sha1::{Digest, Sha1};

use neo_base::Result;
use neo_dispatch::{Action, DispatchTable, Handler};
use neo_proto::{
    AcceptIdentification, AnswerCheckSerialRange, AnswerCheckTidRange, AnswerInformationLocked,
    AnswerObject, AnswerObjectHistory, AnswerObjectHistoryFrom, AnswerOidsFrom, AnswerPack,
    AnswerStoreObject, AnswerTidsFrom, AnswerTransactionInformation, AnswerUndoTransaction, Frame,
    NodeRole, Oid, Packet, PartitionTable, RequestIdentification, Tid, Uuid,
};
use neo_storage::{Engine, ReplicationSource};
use neo_wire::EventLoop;

fn random_uuid(role: NodeRole) -> Uuid {
    let mut entropy = [0u8; 15];
    rand::thread_rng().fill(&mut entropy);
    Uuid::new(role, entropy)
}

const CHECK_CHUNK: u32 = 1024;

/// Counts and digests the TID stream for `partition` over `[min, max]`,
/// mirroring `neo_storage::check::digest_partition`'s walk but also
/// returning the count `AnswerCheckTidRange` needs (the library helper
/// only returns the hash).
fn count_and_hash_tids(engine: &Engine, partition: u32, min: Tid, max: Tid) -> Result<(u64, [u8; 20])> {
    let mut hasher = Sha1::new();
    let mut count = 0u64;
    let mut cursor = Tid(min.0.saturating_sub(1));
    loop {
        let batch = engine.tids_from(partition, cursor, CHECK_CHUNK)?;
        if batch.is_empty() {
            break;
        }
        let mut advanced = false;
        for tid in &batch {
            if *tid > max {
                cursor = Tid::MAX;
                break;
            }
            hasher.update(tid.0.to_be_bytes());
            count += 1;
            cursor = *tid;
            advanced = true;
        }
        if !advanced || cursor == Tid::MAX {
            break;
        }
    }
    Ok((count, hasher.finalize().into()))
}

fn count_and_hash_oids(engine: &Engine, partition: u32) -> Result<(u64, [u8; 20])> {
    let mut hasher = Sha1::new();
    let mut count = 0u64;
    let mut cursor = Oid::ZERO;
    loop {
        let batch = engine.oids_from(partition, cursor, CHECK_CHUNK)?;
        if batch.is_empty() {
            break;
        }
        for oid in &batch {
            hasher.update(oid.0.to_be_bytes());
            count += 1;
            cursor = *oid;
        }
        if batch.len() < CHECK_CHUNK as usize {
            break;
        }
    }
    Ok((count, hasher.finalize().into()))
}

struct StorageState {
    self_uuid: Uuid,
    engine: Engine,
    num_partitions: u32,
    /// Partitions this storage is a replica for, per the last partition
    /// table it was sent (§3: a storage only locks/unlocks/packs the
    /// partitions it actually holds).
    my_partitions: HashSet<u32>,
    /// OIDs staged by `AskLockInformation`, needed again at
    /// `NotifyUnlockInformation` time since that packet carries only the
    /// TID (§4.2).
    staged_oids: HashMap<Tid, Vec<Oid>>,
}

impl StorageState {
    fn adopt_table(&mut self, table: &PartitionTable) {
        self.my_partitions.clear();
        for (partition, cells) in table.cells.iter().enumerate() {
            if cells.iter().any(|c| c.node == self.self_uuid) {
                self.my_partitions.insert(partition as u32);
            }
        }
    }

    fn oids_by_partition(&self, oids: &[Oid]) -> HashMap<u32, Vec<Oid>> {
        let mut grouped: HashMap<u32, Vec<Oid>> = HashMap::new();
        for oid in oids {
            let partition = oid.partition(self.num_partitions);
            if self.my_partitions.contains(&partition) {
                grouped.entry(partition).or_default().push(*oid);
            }
        }
        grouped
    }
}

struct StorageHandler {
    shared: Arc<Mutex<StorageState>>,
    cluster_name: String,
    address: SocketAddr,
}

impl Handler for StorageHandler {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn on_enter(&mut self, _token: Token, outbox: &mut Vec<Frame>) {
        let state = self.shared.lock().unwrap();
        outbox.push(Frame::new(
            0,
            Packet::RequestIdentification(RequestIdentification {
                uuid: state.self_uuid,
                address: Some(self.address),
                cluster_name: self.cluster_name.clone(),
            }),
        ));
    }

    fn on_frame(&mut self, _token: Token, frame: Frame, outbox: &mut Vec<Frame>) -> Action {
        let id = frame.id;
        let mut state = self.shared.lock().unwrap();
        match frame.packet {
            Packet::AcceptIdentification(_) => Action::Continue,
            Packet::SendPartitionTable(msg) => {
                state.adopt_table(&msg.table);
                Action::Continue
            }
            Packet::NotifyPartitionChanges(msg) => {
                // A delta only ever carries the new cell list for the
                // partitions it touches; fold in whichever of those name
                // this storage.
                for (partition, cells) in &msg.delta.changes {
                    let mine = cells.iter().any(|c| c.node == state.self_uuid);
                    if mine {
                        state.my_partitions.insert(*partition);
                    } else {
                        state.my_partitions.remove(partition);
                    }
                }
                Action::Continue
            }
            Packet::NotifyNodeInformation(_) | Packet::NotifyClusterInformation(_) => Action::Continue,

            Packet::AskObject(req) => {
                let partition = req.oid.partition(state.num_partitions);
                match state.engine.load(partition, req.oid, req.at) {
                    Ok(Some(loaded)) => outbox.push(Frame::new(
                        id,
                        Packet::AnswerObject(AnswerObject {
                            oid: req.oid,
                            serial: loaded.serial,
                            next_serial: loaded.next_serial,
                            data: loaded.data,
                            compression: loaded.compression,
                            checksum: loaded.checksum,
                        }),
                    )),
                    Ok(None) => return Action::ProtocolError("no such object revision"),
                    Err(_) => return Action::ProtocolError("storage engine error on load"),
                }
                Action::Continue
            }
            Packet::AskStoreObject(req) => {
                let partition = req.oid.partition(state.num_partitions);
                match state.engine.store(partition, req.oid, req.serial, req.tid, Some(&req.data), req.compression) {
                    Ok(stored) => {
                        let conflict = if stored.conflict { Some(stored.latest) } else { None };
                        outbox.push(Frame::new(id, Packet::AnswerStoreObject(AnswerStoreObject { oid: req.oid, conflict })));
                        Action::Continue
                    }
                    Err(_) => Action::ProtocolError("storage engine error on store"),
                }
            }
            Packet::AskObjectHistory(req) => {
                let partition = req.oid.partition(state.num_partitions);
                match state.engine.history(partition, req.oid, req.offset as usize, req.length as usize) {
                    Ok(history) => {
                        outbox.push(Frame::new(id, Packet::AnswerObjectHistory(AnswerObjectHistory { oid: req.oid, history })));
                        Action::Continue
                    }
                    Err(_) => Action::ProtocolError("storage engine error on history"),
                }
            }
            Packet::AskUndoTransaction(req) => {
                let partition = req.oid.partition(state.num_partitions);
                match state.engine.undo(partition, req.oid, req.undone_tid) {
                    Ok(current_serial) => {
                        outbox.push(Frame::new(id, Packet::AnswerUndoTransaction(AnswerUndoTransaction { oid: req.oid, current_serial })));
                        Action::Continue
                    }
                    Err(_) => Action::ProtocolError("storage engine error on undo"),
                }
            }
            Packet::AskPack(req) => {
                let partitions: Vec<u32> = state.my_partitions.iter().copied().collect();
                for partition in partitions {
                    let oids: Vec<Oid> = match state.engine.oids_from(partition, Oid::ZERO, u32::MAX) {
                        Ok(oids) => oids,
                        Err(_) => return Action::ProtocolError("storage engine error enumerating oids for pack"),
                    };
                    if state.engine.pack(partition, req.tid, &oids).is_err() {
                        return Action::ProtocolError("storage engine error on pack");
                    }
                }
                outbox.push(Frame::new(id, Packet::AnswerPack(AnswerPack { done: true })));
                Action::Continue
            }

            Packet::AskLockInformation(req) => {
                let grouped = state.oids_by_partition(&req.oids);
                for (partition, oids) in &grouped {
                    if state.engine.lock(*partition, req.tid, oids, "", "").is_err() {
                        return Action::ProtocolError("storage engine error on lock");
                    }
                }
                state.staged_oids.insert(req.tid, req.oids.clone());
                outbox.push(Frame::new(id, Packet::AnswerInformationLocked(AnswerInformationLocked { tid: req.tid })));
                Action::Continue
            }
            Packet::NotifyUnlockInformation(req) => {
                if let Some(oids) = state.staged_oids.remove(&req.tid) {
                    let grouped = state.oids_by_partition(&oids);
                    for (partition, oids) in &grouped {
                        let result = if req.commit {
                            state.engine.unlock(*partition, req.tid, oids)
                        } else {
                            state.engine.drop_txn(*partition, req.tid, oids)
                        };
                        if result.is_err() {
                            return Action::ProtocolError("storage engine error on unlock/drop");
                        }
                    }
                }
                Action::Continue
            }

            Packet::AskTidsFrom(req) => match state.engine.tids_from(req.partition, req.after, req.limit) {
                Ok(tids) => {
                    outbox.push(Frame::new(id, Packet::AnswerTidsFrom(AnswerTidsFrom { tids })));
                    Action::Continue
                }
                Err(_) => Action::ProtocolError("storage engine error on tids_from"),
            },
            Packet::AskTransactionInformation(req) => {
                let partition = req.tid.partition(state.num_partitions);
                match state.engine.transaction_info(partition, req.tid) {
                    Ok(Some(info)) => {
                        outbox.push(Frame::new(
                            id,
                            Packet::AnswerTransactionInformation(AnswerTransactionInformation {
                                tid: req.tid,
                                user: info.user.into_bytes(),
                                description: info.description.into_bytes(),
                                extension: info.extension,
                                packed: false,
                                oids: info.oids,
                            }),
                        ));
                        Action::Continue
                    }
                    Ok(None) => Action::ProtocolError("no such transaction"),
                    Err(_) => Action::ProtocolError("storage engine error on transaction_info"),
                }
            }
            Packet::AskOidsFrom(req) => match state.engine.oids_from(req.partition, req.after, req.limit) {
                Ok(oids) => {
                    outbox.push(Frame::new(id, Packet::AnswerOidsFrom(AnswerOidsFrom { oids })));
                    Action::Continue
                }
                Err(_) => Action::ProtocolError("storage engine error on oids_from"),
            },
            Packet::AskObjectHistoryFrom(req) => {
                let partition = req.oid.partition(state.num_partitions);
                match state.engine.object_history_from(partition, req.oid, req.after, req.limit) {
                    Ok(serials) => {
                        outbox.push(Frame::new(id, Packet::AnswerObjectHistoryFrom(AnswerObjectHistoryFrom { oid: req.oid, serials })));
                        Action::Continue
                    }
                    Err(_) => Action::ProtocolError("storage engine error on object_history_from"),
                }
            }

            Packet::AskCheckTidRange(req) => match count_and_hash_tids(&state.engine, req.partition, req.min_tid, req.max_tid) {
                Ok((count, hash)) => {
                    outbox.push(Frame::new(id, Packet::AnswerCheckTidRange(AnswerCheckTidRange { count, hash })));
                    Action::Continue
                }
                Err(_) => Action::ProtocolError("storage engine error on checkTidRange"),
            },
            Packet::AskCheckSerialRange(req) => match count_and_hash_oids(&state.engine, req.partition) {
                Ok((count, hash)) => {
                    outbox.push(Frame::new(id, Packet::AnswerCheckSerialRange(AnswerCheckSerialRange { count, hash })));
                    Action::Continue
                }
                Err(_) => Action::ProtocolError("storage engine error on checkSerialRange"),
            },

            _ => Action::ProtocolError("unexpected packet in storage phase"),
        }
    }
}

/// Runs the storage role until the process is killed: opens the local
/// engine, connects out to the master, identifies, and then serves both
/// the master connection and any client connections accepted on `bind`.
pub fn run_storage(cluster_name: String, bind: SocketAddr, master: SocketAddr, data: PathBuf, num_partitions: u32) -> Result<()> {
    let self_uuid = random_uuid(NodeRole::Storage);
    tracing::info!(?self_uuid, %bind, %master, "starting storage");

    let engine = Engine::open(&data, num_partitions)?;
    let shared = Arc::new(Mutex::new(StorageState {
        self_uuid,
        engine,
        num_partitions,
        my_partitions: HashSet::new(),
        staged_oids: HashMap::new(),
    }));

    let mut event_loop = EventLoop::bind(bind)?;
    event_loop.connect(master)?;
    let mut sink = StorageSink { shared: shared.clone(), cluster_name, address: bind, conns: HashMap::new(), pending_sends: Vec::new() };

    loop {
        event_loop.turn(Some(Duration::from_millis(200)), &mut sink)?;
        let pending = std::mem::take(&mut sink.pending_sends);
        for (token, frame) in pending {
            if let Some(handle) = event_loop.handle(token) {
                let _ = handle.send(&frame);
            }
        }
    }
}

/// Adapts [`neo_wire::Transport`] to the per-connection dispatch model.
/// Frames a handler wants to send (including the very first
/// `RequestIdentification` on the outbound connection to the master) are
/// queued in `pending_sends` and flushed by the caller once `turn()`
/// returns, since a `ConnHandle` can't be obtained from inside a
/// `Transport` callback.
struct StorageSink {
    shared: Arc<Mutex<StorageState>>,
    cluster_name: String,
    address: SocketAddr,
    conns: HashMap<Token, DispatchTable>,
    pending_sends: Vec<(Token, Frame)>,
}

impl StorageSink {
    fn make_handler(&self) -> StorageHandler {
        StorageHandler { shared: self.shared.clone(), cluster_name: self.cluster_name.clone(), address: self.address }
    }
}

impl neo_wire::Transport for StorageSink {
    fn on_accept(&mut self, token: Token, peer: SocketAddr) {
        tracing::debug!(?token, %peer, "storage accepted client connection");
        self.conns.insert(token, DispatchTable::new(Box::new(self.make_handler())));
    }

    fn on_connect(&mut self, token: Token) {
        tracing::debug!(?token, "storage connected to master");
        let mut table = DispatchTable::new(Box::new(self.make_handler()));
        let mut outbox = Vec::new();
        table.enter(token, &mut outbox);
        self.conns.insert(token, table);
        for frame in outbox {
            self.pending_sends.push((token, frame));
        }
    }

    fn on_frame(&mut self, token: Token, frame: Frame) {
        if let Some(table) = self.conns.get_mut(&token) {
            let mut outbox = Vec::new();
            if let Err(e) = table.dispatch(token, frame, &mut outbox) {
                tracing::warn!(?token, error = %e, "storage connection protocol error");
            }
            for frame in outbox {
                self.pending_sends.push((token, frame));
            }
        }
    }

    fn on_closed(&mut self, token: Token) {
        self.conns.remove(&token);
    }

    fn on_error(&mut self, token: Token, error: neo_base::Error) {
        tracing::warn!(?token, %error, "storage connection error");
    }
}
