//! `pack(tid, callback)` (§4.4 "Pack algorithm"): garbage-collects object
//! revisions older than a chosen TID, rewriting forward references so
//! later revisions stay reachable.

use redb::ReadableTable;

use neo_base::Result;
use neo_proto::{Oid, Tid};

use crate::engine::{obj_row_from_bytes, obj_row_to_bytes, Engine, OBJ_TABLE};
use crate::keys::{obj_by_oid_key, unpack_oid_tid_from_obj_key};

impl Engine {
    /// Packs every OID in `partition` up to and including `pack_tid`.
    /// Returns the number of revisions deleted.
    pub fn pack(&self, partition: u32, pack_tid: Tid, oids: &[Oid]) -> Result<u64> {
        let mut deleted = 0u64;
        for &oid in oids {
            deleted += self.pack_one(partition, oid, pack_tid)?;
        }
        self.config_set(&format!("pack_tid/{partition}"), &pack_tid.0.to_be_bytes())?;
        Ok(deleted)
    }

    pub fn pack_tid(&self, partition: u32) -> Result<Tid> {
        match self.config_get(&format!("pack_tid/{partition}"))? {
            Some(bytes) => Ok(Tid(u64::from_be_bytes(bytes.try_into().unwrap_or([0u8; 8])))),
            None => Ok(Tid::ZERO),
        }
    }

    fn pack_one(&self, partition: u32, oid: Oid, pack_tid: Tid) -> Result<u64> {
        let write_txn = self.db().begin_write()?;
        let mut deleted = 0u64;
        {
            let mut table = write_txn.open_table(OBJ_TABLE)?;
            let lower = obj_by_oid_key(partition, oid, Tid::ZERO);
            let upper = obj_by_oid_key(partition, oid, Tid::MAX);

            // Collect all revisions for this OID in tid order.
            let mut revisions: Vec<(Tid, Option<[u8; 20]>, Option<Tid>, bool, u64)> = Vec::new();
            {
                let mut iter = table.range(lower.as_slice()..=upper.as_slice())?;
                while let Some(entry) = iter.next() {
                    let (key, value) = entry?;
                    let (tid, _) = unpack_oid_tid_from_obj_key(key.value());
                    let (hash, value_tid, compression, length) = obj_row_from_bytes(value.value())?;
                    revisions.push((tid, hash, value_tid, compression, length));
                }
            }

            // max_serial: the greatest tid <= pack_tid; bumped past a
            // deletion tombstone so the tombstone itself is also removed.
            let mut max_serial = None;
            for (tid, hash, _, _, _) in &revisions {
                if *tid <= pack_tid {
                    max_serial = Some((*tid, hash.is_none()));
                }
            }
            let max_serial = match max_serial {
                Some((tid, is_deletion)) => {
                    if is_deletion {
                        tid.next()
                    } else {
                        tid
                    }
                }
                None => return Ok(0), // nothing old enough to pack yet
            };

            // Any surviving revision whose value_tid pointed into the
            // packed region is rewritten to point at the new head of
            // history; the first survivor points at `max_serial` itself,
            // later ones at that first survivor.
            let mut rewrite_target = None;
            for (tid, hash, value_tid, compression, length) in revisions.iter() {
                if *tid < max_serial {
                    continue;
                }
                let was_about_to_be_packed = value_tid.map(|vt| vt < max_serial).unwrap_or(false);
                if was_about_to_be_packed {
                    let target = *rewrite_target.get_or_insert(max_serial);
                    let key = obj_by_oid_key(partition, oid, *tid);
                    let bytes = obj_row_to_bytes(*hash, Some(target), *compression, *length)?;
                    table.insert(key.as_slice(), bytes.as_slice())?;
                    rewrite_target = Some(*tid);
                }
            }

            for (tid, _, _, _, _) in revisions.iter() {
                if *tid < max_serial {
                    let key = obj_by_oid_key(partition, oid, *tid);
                    table.remove(key.as_slice())?;
                    deleted += 1;
                }
            }
        }
        write_txn.commit()?;
        self.gc_unreferenced_data()?;
        Ok(deleted)
    }

    /// Deletes `data` rows no longer referenced from any `obj` row.
    /// Reference count is computed by scan, not maintained incrementally
    /// (§4.4: "reference count maintained by join, not by counter").
    fn gc_unreferenced_data(&self) -> Result<()> {
        use std::collections::HashSet;
        let read_txn = self.db().begin_read()?;
        let mut referenced: HashSet<[u8; 20]> = HashSet::new();
        {
            let table = read_txn.open_table(OBJ_TABLE)?;
            let mut iter = table.iter()?;
            while let Some(entry) = iter.next() {
                let (_, value) = entry?;
                if let (Some(hash), ..) = obj_row_from_bytes(value.value())? {
                    referenced.insert(hash);
                }
            }
        }
        let to_delete: Vec<[u8; 20]> = {
            let table = read_txn.open_table(crate::engine::DATA_TABLE)?;
            let mut dead = Vec::new();
            let mut iter = table.iter()?;
            while let Some(entry) = iter.next() {
                let (key, _) = entry?;
                let hash: [u8; 20] = key.value().try_into().unwrap();
                if !referenced.contains(&hash) {
                    dead.push(hash);
                }
            }
            dead
        };
        drop(read_txn);
        if !to_delete.is_empty() {
            let write_txn = self.db().begin_write()?;
            {
                let mut table = write_txn.open_table(crate::engine::DATA_TABLE)?;
                for hash in &to_delete {
                    table.remove(hash.as_slice())?;
                }
            }
            write_txn.commit()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(&dir.path().join("store.redb"), 1).unwrap();
        (engine, dir)
    }

    fn commit(engine: &Engine, oid: Oid, tid: Tid, data: Option<&[u8]>) {
        engine.store(0, oid, None, tid, data, false).unwrap();
        engine.lock(0, tid, &[oid], "u", "").unwrap();
        engine.unlock(0, tid, &[oid]).unwrap();
    }

    #[test]
    fn pack_deletes_revisions_older_than_the_surviving_head() {
        let (engine, _dir) = engine();
        let oid = Oid(1);
        commit(&engine, oid, Tid(10), Some(b"a"));
        commit(&engine, oid, Tid(20), Some(b"b"));
        commit(&engine, oid, Tid(30), Some(b"c"));

        let deleted = engine.pack(0, Tid(20), &[oid]).unwrap();
        assert_eq!(deleted, 1, "only the tid=10 revision predates tid=20");
        assert!(engine.load(0, oid, Tid(10)).unwrap().is_none());
        assert_eq!(engine.load(0, oid, Tid(20)).unwrap().unwrap().data.unwrap(), b"b");
        assert_eq!(engine.history(0, oid, 0, 10).unwrap().len(), 2);
    }

    #[test]
    fn packing_twice_is_idempotent() {
        let (engine, _dir) = engine();
        let oid = Oid(1);
        commit(&engine, oid, Tid(10), Some(b"a"));
        commit(&engine, oid, Tid(20), Some(b"b"));
        let first = engine.pack(0, Tid(20), &[oid]).unwrap();
        assert_eq!(first, 1);
        let second = engine.pack(0, Tid(20), &[oid]).unwrap();
        assert_eq!(second, 0);
    }

    #[test]
    fn pack_removes_a_deletion_tombstone_that_predates_the_cutoff() {
        let (engine, _dir) = engine();
        let oid = Oid(1);
        commit(&engine, oid, Tid(10), Some(b"a"));
        commit(&engine, oid, Tid(20), None); // deletion
        commit(&engine, oid, Tid(30), Some(b"c"));

        let deleted = engine.pack(0, Tid(20), &[oid]).unwrap();
        // max_serial bumps past the tid=20 tombstone to tid=30; both
        // tid=10 and tid=20 are removed.
        assert_eq!(deleted, 2);
        assert!(engine.load(0, oid, Tid(20)).unwrap().is_none());
        assert_eq!(engine.load(0, oid, Tid(30)).unwrap().unwrap().data.unwrap(), b"c");
    }
}
