//! Wires the embedding interface's [`crate::client::Backend`] to real
//! connections via the dispatcher (§4.5: "a pool of connections to
//! storages (lazy, one per partition group)"). `last_transaction` is
//! tracked locally from the client's own commits and invalidations rather
//! than round-tripping to the master on every call — the wire protocol
//! has no dedicated packet for it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use neo_base::{err, Result};
use neo_dispatch::Dispatcher;
use neo_proto::{
    AskAbortTransaction, AskBeginTransaction, AskFinishTransaction, AskNewOids, AskObject, AskObjectHistory,
    AskStoreObject, AskUndoTransaction, Frame, Oid, Packet, Tid,
};
use neo_wire::ConnHandle;

use crate::client::{Backend, StoreReply};

/// Routes object-I/O requests to the right storage connection and
/// transaction-coordination requests to the master.
pub struct NetBackend {
    master: ConnHandle,
    storage_of: Box<dyn Fn(Oid) -> ConnHandle + Send + Sync>,
    dispatcher: Dispatcher,
    next_id: AtomicU32,
    timeout: Duration,
    last_tid: AtomicU64,
}

impl NetBackend {
    pub fn new(
        master: ConnHandle,
        storage_of: impl Fn(Oid) -> ConnHandle + Send + Sync + 'static,
        dispatcher: Dispatcher,
        timeout: Duration,
    ) -> NetBackend {
        NetBackend {
            master,
            storage_of: Box::new(storage_of),
            dispatcher,
            next_id: AtomicU32::new(1),
            timeout,
            last_tid: AtomicU64::new(0),
        }
    }

    /// Called by the network layer on `InvalidateObjects` so
    /// `last_transaction` tracks the master's view without polling it.
    pub fn observe_tid(&self, tid: Tid) {
        self.last_tid.fetch_max(tid.0, Ordering::Relaxed);
    }

    fn call(&self, conn: &ConnHandle, packet: Packet) -> Result<Packet> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.dispatcher.register(conn.token, id);
        conn.send(&Frame::new(id, packet))?;
        match self.dispatcher.wait(id, receiver, self.timeout) {
            Some(frame) => match frame.packet {
                Packet::Error(e) => Err(err(e.message)),
                other => Ok(other),
            },
            None => Err(err("request timed out or the connection was lost")),
        }
    }
}

impl Backend for NetBackend {
    fn new_oid(&self) -> Result<Oid> {
        match self.call(&self.master, Packet::AskNewOids(AskNewOids { count: 1 }))? {
            Packet::AnswerNewOids(a) => a.oids.into_iter().next().ok_or_else(|| err("master returned no oids")),
            _ => Err(err("unexpected answer to AskNewOids")),
        }
    }

    fn begin(&self) -> Result<Tid> {
        match self.call(&self.master, Packet::AskBeginTransaction(AskBeginTransaction))? {
            Packet::AnswerBeginTransaction(a) => Ok(a.tid),
            _ => Err(err("unexpected answer to AskBeginTransaction")),
        }
    }

    fn load(&self, oid: Oid, at: Tid) -> Result<Option<(Tid, Option<Vec<u8>>)>> {
        let conn = (self.storage_of)(oid);
        match self.call(&conn, Packet::AskObject(AskObject { oid, at }))? {
            Packet::AnswerObject(a) => Ok(Some((a.serial, a.data))),
            _ => Err(err("unexpected answer to AskObject")),
        }
    }

    fn store(&self, tid: Tid, oid: Oid, serial: Option<Tid>, data: Option<Vec<u8>>) -> Result<StoreReply> {
        let conn = (self.storage_of)(oid);
        let packet = Packet::AskStoreObject(AskStoreObject {
            oid,
            serial,
            tid,
            data: data.unwrap_or_default(),
            compression: false,
        });
        match self.call(&conn, packet)? {
            Packet::AnswerStoreObject(a) => Ok(StoreReply { latest: a.conflict.unwrap_or(Tid::ZERO), conflict: a.conflict.is_some() }),
            _ => Err(err("unexpected answer to AskStoreObject")),
        }
    }

    fn vote(&self, _tid: Tid) -> Result<()> {
        // Storage locking is coordinated by the master as part of finish;
        // the client has nothing further to send at vote time.
        Ok(())
    }

    fn finish(&self, tid: Tid, oids: &[Oid]) -> Result<()> {
        match self.call(&self.master, Packet::AskFinishTransaction(AskFinishTransaction { tid, oids: oids.to_vec() }))? {
            Packet::AnswerFinishTransaction(a) => {
                self.observe_tid(a.tid);
                Ok(())
            }
            _ => Err(err("unexpected answer to AskFinishTransaction")),
        }
    }

    fn abort(&self, tid: Tid) -> Result<()> {
        match self.call(&self.master, Packet::AskAbortTransaction(AskAbortTransaction { tid }))? {
            Packet::AnswerAbortTransaction(_) => Ok(()),
            _ => Err(err("unexpected answer to AskAbortTransaction")),
        }
    }

    fn history(&self, oid: Oid, offset: usize, length: usize) -> Result<Vec<(Tid, u64)>> {
        let conn = (self.storage_of)(oid);
        let packet = Packet::AskObjectHistory(AskObjectHistory { oid, offset: offset as u32, length: length as u32 });
        match self.call(&conn, packet)? {
            Packet::AnswerObjectHistory(a) => Ok(a.history),
            _ => Err(err("unexpected answer to AskObjectHistory")),
        }
    }

    fn undo(&self, oid: Oid, undone_tid: Tid) -> Result<Tid> {
        let conn = (self.storage_of)(oid);
        match self.call(&conn, Packet::AskUndoTransaction(AskUndoTransaction { undone_tid, oid }))? {
            Packet::AnswerUndoTransaction(a) => Ok(a.current_serial),
            _ => Err(err("unexpected answer to AskUndoTransaction")),
        }
    }

    fn last_transaction(&self) -> Result<Tid> {
        Ok(Tid(self.last_tid.load(Ordering::Relaxed)))
    }
}
