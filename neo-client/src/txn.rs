//! Per-thread transaction scratchpad (§4.5): "a per-thread local scratchpad
//! holding the in-flight transaction's reply slots."

use neo_proto::{Oid, Tid};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    Open,
    Voting,
    Voted,
}

/// One pending store, tracked so `tpc_vote`/`tpc_abort` know what to
/// reconcile or roll back.
#[derive(Clone, Debug)]
pub struct PendingStore {
    pub oid: Oid,
    pub serial: Option<Tid>,
    pub data: Option<Vec<u8>>,
}

/// State for one in-flight transaction, scoped to the thread that called
/// `tpc_begin`.
pub struct Scratchpad {
    pub tid: Tid,
    pub state: TxnState,
    pub stores: Vec<PendingStore>,
}

impl Scratchpad {
    pub fn new(tid: Tid) -> Scratchpad {
        Scratchpad { tid, state: TxnState::Open, stores: Vec::new() }
    }

    pub fn record_store(&mut self, oid: Oid, serial: Option<Tid>, data: Option<Vec<u8>>) {
        self.stores.retain(|s| s.oid != oid);
        self.stores.push(PendingStore { oid, serial, data });
    }

    pub fn oids(&self) -> Vec<Oid> {
        self.stores.iter().map(|s| s.oid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn recording_the_same_oid_twice_keeps_only_the_latest() {
        let mut pad = Scratchpad::new(Tid(1));
        pad.record_store(Oid(1), None, Some(b"a".to_vec()));
        pad.record_store(Oid(1), Some(Tid(5)), Some(b"b".to_vec()));
        assert_eq!(pad.stores.len(), 1);
        assert_eq!(pad.stores[0].data.as_ref().unwrap(), b"b");
    }
}
