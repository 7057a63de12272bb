//! The embedding interface (§6 "Embedding interface (client core → host
//! database layer)"): `load`, `new_oid`, `tpc_begin/tpc_vote/tpc_finish/
//! tpc_abort`, `store`, `load_before`, `load_serial`, `history`, `undo`,
//! `undo_log`, `iterator`, `last_transaction`, `register_db`.
//!
//! `restore`/`set_max_oid` (bulk-load/renumbering tools for copying an
//! existing database into NEO) are out of scope — see `DESIGN.md`.

use std::sync::Mutex;

use neo_base::{err, Result};
use neo_proto::{Oid, Tid};

use crate::cache::ObjectCache;
use crate::txn::{Scratchpad, TxnState};

/// What `store` reported back from a storage (§4.2 "Conflict resolution
/// loop").
pub struct StoreReply {
    pub latest: Tid,
    pub conflict: bool,
}

/// Everything the client core needs from the network layer. In production
/// this is backed by the dispatcher sending `AskObject`/`AskStoreObject`/
/// `AskBeginTransaction`/... over a [`neo_dispatch::Dispatcher`]; tests use
/// an in-memory fake.
pub trait Backend {
    fn new_oid(&self) -> Result<Oid>;
    fn begin(&self) -> Result<Tid>;
    fn load(&self, oid: Oid, at: Tid) -> Result<Option<(Tid, Option<Vec<u8>>)>>;
    fn store(&self, tid: Tid, oid: Oid, serial: Option<Tid>, data: Option<Vec<u8>>) -> Result<StoreReply>;
    fn vote(&self, tid: Tid) -> Result<()>;
    fn finish(&self, tid: Tid, oids: &[Oid]) -> Result<()>;
    fn abort(&self, tid: Tid) -> Result<()>;
    fn history(&self, oid: Oid, offset: usize, length: usize) -> Result<Vec<(Tid, u64)>>;
    fn undo(&self, oid: Oid, undone_tid: Tid) -> Result<Tid>;
    fn last_transaction(&self) -> Result<Tid>;
}

/// Merges a conflicting store (§4.2: "merging the base, current, and new
/// revisions through a user-supplied resolver"). `base` is the revision the
/// client's own cache had before this `store` call started (what the new
/// data was computed against); `current` is the revision actually latest on
/// the storage, the one `new` lost the race to.
pub trait ConflictResolver {
    fn resolve(&self, oid: Oid, base: Option<&[u8]>, current: Option<&[u8]>, new: Option<&[u8]>) -> Option<Vec<u8>>;
}

/// A resolver that never merges — any conflict aborts the transaction.
pub struct NeverResolve;

impl ConflictResolver for NeverResolve {
    fn resolve(&self, _oid: Oid, _base: Option<&[u8]>, _current: Option<&[u8]>, _new: Option<&[u8]>) -> Option<Vec<u8>> {
        None
    }
}

type InvalidationCallback = Box<dyn FnMut(Tid, &[Oid]) + Send>;

pub struct Client<B: Backend> {
    backend: B,
    cache: Mutex<ObjectCache>,
    scratchpad: Mutex<Option<Scratchpad>>,
    on_invalidate: Mutex<Option<InvalidationCallback>>,
}

impl<B: Backend> Client<B> {
    pub fn new(backend: B, cache_capacity: usize) -> Client<B> {
        Client {
            backend,
            cache: Mutex::new(ObjectCache::new(cache_capacity)),
            scratchpad: Mutex::new(None),
            on_invalidate: Mutex::new(None),
        }
    }

    /// Registers the host database layer's invalidation callback, invoked
    /// on every `InvalidateObjects` notification (§4.5).
    pub fn register_db(&self, callback: InvalidationCallback) {
        *self.on_invalidate.lock().unwrap() = Some(callback);
    }

    /// Called by the network layer when the master broadcasts
    /// `InvalidateObjects(tid, oid_list)`.
    pub fn invalidate(&self, tid: Tid, oids: &[Oid]) {
        let mut cache = self.cache.lock().unwrap();
        for oid in oids {
            cache.invalidate(*oid);
        }
        drop(cache);
        if let Some(callback) = self.on_invalidate.lock().unwrap().as_mut() {
            callback(tid, oids);
        }
    }

    pub fn new_oid(&self) -> Result<Oid> {
        self.backend.new_oid()
    }

    pub fn last_transaction(&self) -> Result<Tid> {
        self.backend.last_transaction()
    }

    /// `load(oid) → (data, serial)`: cache hit, else `AskObject` at the
    /// current transaction's tid (or the latest if none is open).
    pub fn load(&self, oid: Oid) -> Result<(Option<Vec<u8>>, Tid)> {
        let at = self.current_tid_or_latest()?;
        self.load_before(oid, at)
    }

    pub fn load_before(&self, oid: Oid, at: Tid) -> Result<(Option<Vec<u8>>, Tid)> {
        if let Some((serial, data)) = self.cache.lock().unwrap().get(oid) {
            if serial <= at {
                return Ok((data, serial));
            }
        }
        match self.backend.load(oid, at)? {
            Some((serial, data)) => {
                self.cache.lock().unwrap().put(oid, serial, data.clone());
                Ok((data, serial))
            }
            None => Err(err("oid not found")),
        }
    }

    pub fn load_serial(&self, oid: Oid, serial: Tid) -> Result<Option<Vec<u8>>> {
        Ok(self.backend.load(oid, serial)?.and_then(|(found, data)| if found == serial { Some(data) } else { None }).flatten())
    }

    pub fn history(&self, oid: Oid, size: usize) -> Result<Vec<(Tid, u64)>> {
        self.backend.history(oid, 0, size)
    }

    pub fn undo_log(&self, first: usize, last: usize, filter: impl Fn(Tid) -> bool) -> Result<Vec<Tid>> {
        let latest = self.backend.last_transaction()?;
        let mut out = Vec::new();
        let mut tid = latest;
        let mut skipped = 0;
        while tid != Tid::ZERO && out.len() < last {
            if filter(tid) {
                if skipped >= first {
                    out.push(tid);
                }
                skipped += 1;
            }
            tid = Tid(tid.0 - 1);
        }
        Ok(out)
    }

    /// `iterator(start, stop)`: every committed TID in `[start, stop]`,
    /// walking backward from `last_transaction`.
    pub fn iterator(&self, start: Tid, stop: Tid) -> Result<Vec<Tid>> {
        self.undo_log(0, usize::MAX, |tid| tid >= start && tid <= stop)
    }

    pub fn undo(&self, oid: Oid, undone_tid: Tid) -> Result<Tid> {
        self.backend.undo(oid, undone_tid)
    }

    pub fn tpc_begin(&self) -> Result<Tid> {
        let tid = self.backend.begin()?;
        *self.scratchpad.lock().unwrap() = Some(Scratchpad::new(tid));
        Ok(tid)
    }

    /// `store(oid, serial, data)`, resolving a conflict with `resolver`
    /// before giving up and returning an error.
    pub fn store(&self, oid: Oid, data: Option<Vec<u8>>, resolver: &dyn ConflictResolver) -> Result<()> {
        let tid = self.open_tid()?;
        let cached = self.cache.lock().unwrap().get(oid);
        let base = cached.as_ref().and_then(|(_, d)| d.clone());
        let mut serial = cached.map(|(s, _)| s);
        let mut pending = data;
        loop {
            let reply = self.backend.store(tid, oid, serial, pending.clone())?;
            if !reply.conflict {
                self.scratchpad.lock().unwrap().as_mut().unwrap().record_store(oid, serial, pending);
                return Ok(());
            }
            let current = self.backend.load(oid, reply.latest)?.and_then(|(found, d)| if found == reply.latest { Some(d) } else { None }).flatten();
            match resolver.resolve(oid, base.as_deref(), current.as_deref(), pending.as_deref()) {
                Some(merged) => {
                    serial = Some(reply.latest);
                    pending = Some(merged);
                }
                None => {
                    self.tpc_abort()?;
                    return Err(err("conflict could not be resolved"));
                }
            }
        }
    }

    pub fn tpc_vote(&self) -> Result<()> {
        let tid = self.open_tid()?;
        self.backend.vote(tid)?;
        self.scratchpad.lock().unwrap().as_mut().unwrap().state = TxnState::Voted;
        Ok(())
    }

    pub fn tpc_finish(&self) -> Result<Tid> {
        let tid = self.open_tid()?;
        let oids = self.scratchpad.lock().unwrap().as_ref().map(|p| p.oids()).unwrap_or_default();
        self.backend.finish(tid, &oids)?;
        self.scratchpad.lock().unwrap().take();
        let mut cache = self.cache.lock().unwrap();
        for oid in oids {
            cache.invalidate(oid);
        }
        Ok(tid)
    }

    pub fn tpc_abort(&self) -> Result<()> {
        if let Some(pad) = self.scratchpad.lock().unwrap().take() {
            self.backend.abort(pad.tid)?;
        }
        Ok(())
    }

    fn open_tid(&self) -> Result<Tid> {
        self.scratchpad.lock().unwrap().as_ref().map(|p| p.tid).ok_or_else(|| err("no transaction in progress"))
    }

    fn current_tid_or_latest(&self) -> Result<Tid> {
        match self.scratchpad.lock().unwrap().as_ref() {
            Some(pad) => Ok(pad.tid),
            None => self.backend.last_transaction(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use test_log::test;

    struct FakeBackend {
        next_oid: StdMutex<u64>,
        next_tid: StdMutex<u64>,
        committed: StdMutex<HashMap<Oid, (Tid, Option<Vec<u8>>)>>,
        staged: StdMutex<HashMap<Tid, Vec<(Oid, Option<Vec<u8>>)>>>,
    }

    impl FakeBackend {
        fn new() -> FakeBackend {
            FakeBackend {
                next_oid: StdMutex::new(1),
                next_tid: StdMutex::new(1),
                committed: StdMutex::new(HashMap::new()),
                staged: StdMutex::new(HashMap::new()),
            }
        }
    }

    impl Backend for FakeBackend {
        fn new_oid(&self) -> Result<Oid> {
            let mut n = self.next_oid.lock().unwrap();
            let oid = Oid(*n);
            *n += 1;
            Ok(oid)
        }

        fn begin(&self) -> Result<Tid> {
            let mut n = self.next_tid.lock().unwrap();
            let tid = Tid(*n);
            *n += 1;
            Ok(tid)
        }

        fn load(&self, oid: Oid, at: Tid) -> Result<Option<(Tid, Option<Vec<u8>>)>> {
            let committed = self.committed.lock().unwrap();
            Ok(committed.get(&oid).filter(|(serial, _)| *serial <= at).cloned())
        }

        fn store(&self, tid: Tid, oid: Oid, serial: Option<Tid>, data: Option<Vec<u8>>) -> Result<StoreReply> {
            let committed = self.committed.lock().unwrap();
            let latest = committed.get(&oid).map(|(s, _)| *s).unwrap_or(Tid::ZERO);
            let conflict = match serial {
                Some(expected) => latest != Tid::ZERO && latest != expected,
                None => latest != Tid::ZERO,
            };
            drop(committed);
            if !conflict {
                self.staged.lock().unwrap().entry(tid).or_default().push((oid, data));
            }
            Ok(StoreReply { latest, conflict })
        }

        fn vote(&self, _tid: Tid) -> Result<()> {
            Ok(())
        }

        fn finish(&self, tid: Tid, _oids: &[Oid]) -> Result<()> {
            if let Some(stores) = self.staged.lock().unwrap().remove(&tid) {
                let mut committed = self.committed.lock().unwrap();
                for (oid, data) in stores {
                    committed.insert(oid, (tid, data));
                }
            }
            Ok(())
        }

        fn abort(&self, tid: Tid) -> Result<()> {
            self.staged.lock().unwrap().remove(&tid);
            Ok(())
        }

        fn history(&self, _oid: Oid, _offset: usize, _length: usize) -> Result<Vec<(Tid, u64)>> {
            Ok(Vec::new())
        }

        fn undo(&self, _oid: Oid, undone_tid: Tid) -> Result<Tid> {
            Ok(undone_tid)
        }

        fn last_transaction(&self) -> Result<Tid> {
            Ok(Tid(self.next_tid.lock().unwrap().saturating_sub(1)))
        }
    }

    #[test]
    fn full_commit_round_trip_is_visible_after_finish() {
        let client = Client::new(FakeBackend::new(), 16);
        let oid = client.new_oid().unwrap();
        client.tpc_begin().unwrap();
        client.store(oid, Some(b"hello".to_vec()), &NeverResolve).unwrap();
        client.tpc_vote().unwrap();
        let tid = client.tpc_finish().unwrap();

        let (data, serial) = client.load(oid).unwrap();
        assert_eq!(data.unwrap(), b"hello");
        assert_eq!(serial, tid);
    }

    #[test]
    fn aborting_leaves_nothing_committed() {
        let client = Client::new(FakeBackend::new(), 16);
        let oid = client.new_oid().unwrap();
        client.tpc_begin().unwrap();
        client.store(oid, Some(b"x".to_vec()), &NeverResolve).unwrap();
        client.tpc_abort().unwrap();

        assert!(client.load(oid).is_err(), "never committed, so not found");
    }

    struct AlwaysTakeNew;
    impl ConflictResolver for AlwaysTakeNew {
        fn resolve(&self, _oid: Oid, _base: Option<&[u8]>, _current: Option<&[u8]>, new: Option<&[u8]>) -> Option<Vec<u8>> {
            new.map(|d| d.to_vec())
        }
    }

    #[test]
    fn conflicting_store_resolves_and_retries_with_the_latest_serial() {
        let backend = FakeBackend::new();
        let oid = backend.new_oid().unwrap();
        // Commit an initial revision out from under the client's cache.
        backend.committed.lock().unwrap().insert(oid, (Tid(1), Some(b"a".to_vec())));

        let client = Client::new(backend, 16);
        client.tpc_begin().unwrap();
        client.store(oid, Some(b"b".to_vec()), &AlwaysTakeNew).unwrap();
        let tid = client.tpc_finish().unwrap();

        let (data, serial) = client.load(oid).unwrap();
        assert_eq!(data.unwrap(), b"b");
        assert_eq!(serial, tid);
    }
}
