use std::collections::{BTreeMap, BTreeSet};

use neo_proto::{Oid, PartitionTable, Tid, Uuid};

/// A batch of 100 OIDs per request, per §4.2 ("Clients ask for OIDs in
/// batches of 100").
pub const OID_BATCH_SIZE: u32 = 100;

/// Allocates TIDs and OIDs; the master is the sole allocator for both
/// (§4.2). TIDs are handed out by the caller via [`neo_proto::tid`]; this
/// struct only tracks the high-water marks needed for monotonicity and OID
/// ranges.
pub struct Allocator {
    last_tid: Tid,
    next_oid: u64,
}

impl Allocator {
    pub fn new(last_tid: Tid, next_oid: u64) -> Allocator {
        Allocator { last_tid, next_oid: next_oid.max(1) }
    }

    /// Records a newly issued TID, enforcing strict monotonicity.
    pub fn record_tid(&mut self, tid: Tid) {
        if tid > self.last_tid {
            self.last_tid = tid;
        }
    }

    pub fn last_tid(&self) -> Tid {
        self.last_tid
    }

    /// Bumps the TID high-water mark from a storage's recovery report
    /// (§4.2: "greater than the last persisted TID reported by any
    /// storage").
    pub fn observe_storage_tid(&mut self, reported: Tid) {
        if reported > self.last_tid {
            self.last_tid = reported;
        }
    }

    pub fn new_oids(&mut self, count: u32) -> Vec<Oid> {
        let start = self.next_oid;
        self.next_oid += count as u64;
        (start..start + count as u64).map(Oid).collect()
    }
}

/// Coordinator-side lifecycle of one transaction (§3 "Transaction
/// lifecycle (coordinator view)").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    Begun,
    Prepared,
    Locked,
}

/// One in-flight transaction as tracked by the master coordinator.
pub struct Transaction {
    pub tid: Tid,
    pub oids: Vec<Oid>,
    pub state: TxnState,
    /// Storages that must answer `NotifyInformationLocked` before the
    /// transaction can be finished.
    pub awaiting_lock: BTreeSet<Uuid>,
    /// Every storage ever involved, kept so `finish`/`abort` know who to
    /// notify even after `awaiting_lock` has drained.
    pub involved: BTreeSet<Uuid>,
}

impl Transaction {
    fn new(tid: Tid, oids: Vec<Oid>, involved: BTreeSet<Uuid>) -> Transaction {
        Transaction {
            tid,
            oids,
            state: TxnState::Prepared,
            awaiting_lock: involved.clone(),
            involved,
        }
    }
}

/// The master's 2PC coordinator (§4.2). Holds one [`Transaction`] per
/// in-flight TID and the [`Allocator`] for TIDs/OIDs.
pub struct Coordinator {
    pub allocator: Allocator,
    transactions: BTreeMap<Tid, Transaction>,
}

impl Coordinator {
    pub fn new(allocator: Allocator) -> Coordinator {
        Coordinator { allocator, transactions: BTreeMap::new() }
    }

    /// `AskBeginTransaction`: allocates a fresh TID strictly after every
    /// previously issued one.
    pub fn begin(&mut self, candidate: Tid) -> Tid {
        let tid = if candidate > self.allocator.last_tid() {
            candidate
        } else {
            self.allocator.last_tid().next()
        };
        self.allocator.record_tid(tid);
        tid
    }

    pub fn new_oids(&mut self, count: u32) -> Vec<Oid> {
        self.allocator.new_oids(count)
    }

    /// `AskFinishTransaction(oids, tid)`: computes the set of storages
    /// touched by the transaction's partitions (§4.2 "Prepare") and starts
    /// waiting for their locks. Returns the storages to send
    /// `AskLockInformation` to.
    pub fn prepare(&mut self, tid: Tid, oids: Vec<Oid>, pt: &PartitionTable) -> Vec<Uuid> {
        let mut involved = BTreeSet::new();
        for oid in &oids {
            let partition = oid.partition(pt.num_partitions);
            involved.extend(pt.readable_cells(partition).map(|c| c.node));
        }
        for cell in pt.readable_cells(tid.partition(pt.num_partitions)) {
            involved.insert(cell.node);
        }
        let storages: Vec<Uuid> = involved.iter().copied().collect();
        self.transactions.insert(tid, Transaction::new(tid, oids, involved));
        storages
    }

    /// `NotifyInformationLocked(tid)` from `uuid`. Returns `true` once
    /// every involved storage has acknowledged and the transaction is
    /// ready to finish.
    pub fn on_lock_ack(&mut self, tid: Tid, uuid: Uuid) -> bool {
        match self.transactions.get_mut(&tid) {
            Some(txn) => {
                txn.awaiting_lock.remove(&uuid);
                if txn.awaiting_lock.is_empty() {
                    txn.state = TxnState::Locked;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Finishes a locked transaction: returns the OIDs to invalidate and
    /// the storages to send `NotifyUnlockInformation` to, then forgets it.
    pub fn finish(&mut self, tid: Tid) -> Option<(Vec<Oid>, Vec<Uuid>)> {
        let txn = self.transactions.remove(&tid)?;
        if txn.state != TxnState::Locked {
            // Put it back; the caller asked too early.
            self.transactions.insert(tid, txn);
            return None;
        }
        Some((txn.oids, txn.involved.into_iter().collect()))
    }

    /// `AskAbortTransaction(tid)` or a detected client failure. Idempotent:
    /// aborting an unknown TID is a no-op (§4.2 "Abort").
    pub fn abort(&mut self, tid: Tid) -> Vec<Uuid> {
        match self.transactions.remove(&tid) {
            Some(txn) => txn.involved.into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// A storage was lost. Removes it from every pending transaction's
    /// expected-ack set (§4.2 "Node loss during 2PC"); returns the TIDs
    /// that became lockable as a result.
    pub fn forget(&mut self, uuid: Uuid) -> Vec<Tid> {
        let mut newly_locked = Vec::new();
        for (tid, txn) in self.transactions.iter_mut() {
            txn.involved.remove(&uuid);
            if txn.awaiting_lock.remove(&uuid) && txn.awaiting_lock.is_empty() && txn.state == TxnState::Prepared {
                txn.state = TxnState::Locked;
                newly_locked.push(*tid);
            }
        }
        newly_locked
    }

    pub fn get(&self, tid: Tid) -> Option<&Transaction> {
        self.transactions.get(&tid)
    }

    pub fn pending_count(&self) -> usize {
        self.transactions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neo_proto::{Cell, CellState, NodeRole};
    use test_log::test;

    fn uuid(n: u8) -> Uuid {
        Uuid::new(NodeRole::Storage, [n; 15])
    }

    fn single_cell_table() -> PartitionTable {
        let mut table = PartitionTable::new(1, 1);
        table.cells[0] = vec![Cell { node: uuid(1), state: CellState::UpToDate }];
        table
    }

    #[test]
    fn begin_is_strictly_monotonic() {
        let mut coord = Coordinator::new(Allocator::new(Tid::ZERO, 1));
        let a = coord.begin(Tid(5));
        let b = coord.begin(Tid(5));
        assert!(a < b, "repeated candidate TID must still advance");
    }

    #[test]
    fn new_oids_returns_contiguous_batches() {
        let mut coord = Coordinator::new(Allocator::new(Tid::ZERO, 1));
        let first = coord.new_oids(OID_BATCH_SIZE);
        let second = coord.new_oids(OID_BATCH_SIZE);
        assert_eq!(first.len(), OID_BATCH_SIZE as usize);
        assert_eq!(second[0].0, first.last().unwrap().0 + 1);
    }

    #[test]
    fn full_commit_round_trip() {
        let mut coord = Coordinator::new(Allocator::new(Tid::ZERO, 1));
        let table = single_cell_table();
        let tid = coord.begin(Tid(1));
        let oids = vec![Oid(1)];
        let storages = coord.prepare(tid, oids.clone(), &table);
        assert_eq!(storages, vec![uuid(1)]);
        assert!(coord.finish(tid).is_none(), "not lockable yet");
        assert!(coord.on_lock_ack(tid, uuid(1)));
        let (invalidated, notify) = coord.finish(tid).unwrap();
        assert_eq!(invalidated, oids);
        assert_eq!(notify, vec![uuid(1)]);
        assert_eq!(coord.pending_count(), 0);
    }

    #[test]
    fn abort_is_idempotent_on_unknown_tid() {
        let mut coord = Coordinator::new(Allocator::new(Tid::ZERO, 1));
        assert!(coord.abort(Tid(42)).is_empty());
        assert!(coord.abort(Tid(42)).is_empty());
    }

    #[test]
    fn forget_unblocks_a_transaction_missing_only_the_lost_storage() {
        let mut coord = Coordinator::new(Allocator::new(Tid::ZERO, 1));
        let mut table = PartitionTable::new(1, 2);
        table.cells[0] = vec![
            Cell { node: uuid(1), state: CellState::UpToDate },
            Cell { node: uuid(2), state: CellState::UpToDate },
        ];
        let tid = coord.begin(Tid(1));
        coord.prepare(tid, vec![Oid(1)], &table);
        coord.on_lock_ack(tid, uuid(1));
        let unblocked = coord.forget(uuid(2));
        assert_eq!(unblocked, vec![tid]);
        assert!(coord.finish(tid).is_some());
    }
}
