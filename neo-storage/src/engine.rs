//! Storage-side metadata engine (§4.4): the revision-addressed object and
//! transaction tables, backed by `redb`. Table layout mirrors §3's
//! `config`/`pt`/`trans`/`obj`/`data`/`ttrans`/`tobj`, simplified where the
//! operation set in scope doesn't need the full shape (see `DESIGN.md`):
//! `obj`/`tobj` are stored directly under the `(partition, oid, tid)`
//! ordering that every read path (`load`, `history`, `pack`, replication)
//! actually scans by, rather than also maintaining a separate
//! `(partition, tid, oid)` primary table nothing here queries.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use neo_base::{err, Error, Result};
use neo_proto::{Oid, Tid};

use crate::keys::{obj_by_oid_key, obj_by_oid_prefix, trans_key, unpack_oid_tid_from_obj_key};

const CONFIG: TableDefinition<&str, &[u8]> = TableDefinition::new("config");
const PT: TableDefinition<&[u8], u8> = TableDefinition::new("pt");
const TRANS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("trans");
const OBJ: TableDefinition<&[u8], &[u8]> = TableDefinition::new("obj");
const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");
const TTRANS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ttrans");
const TOBJ: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tobj");

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ObjRow {
    /// `None` is a deletion tombstone (unless `value_tid` is set, in which
    /// case it means "same bytes as the revision at `value_tid`" — the
    /// shape `undo` produces, per §3).
    data_hash: Option<[u8; 20]>,
    value_tid: Option<Tid>,
    compression: bool,
    length: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TransRow {
    oids: Vec<Oid>,
    user: String,
    description: String,
    extension: Vec<u8>,
    packed: bool,
    locked: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct DataRow {
    compression: bool,
    bytes: Vec<u8>,
}

fn hash_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Result of a successful `load`.
pub struct Loaded {
    pub serial: Tid,
    pub next_serial: Option<Tid>,
    pub data: Option<Vec<u8>>,
    pub compression: bool,
    pub checksum: [u8; 20],
}

/// Result of a `store`: whether the storage already holds a later revision
/// than the client's `serial` (§4.2 "Conflict resolution loop").
pub struct Stored {
    pub latest: Tid,
    pub conflict: bool,
}

/// The object/transaction metadata engine for the partitions this storage
/// node is responsible for.
pub struct Engine {
    db: Database,
    pub num_partitions: u32,
}

impl Engine {
    pub fn open(path: &Path, num_partitions: u32) -> Result<Engine> {
        let db = Database::create(path)?;
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(CONFIG)?;
            write_txn.open_table(PT)?;
            write_txn.open_table(TRANS)?;
            write_txn.open_table(OBJ)?;
            write_txn.open_table(DATA)?;
            write_txn.open_table(TTRANS)?;
            write_txn.open_table(TOBJ)?;
            write_txn.commit()?;
        }
        Ok(Engine { db, num_partitions })
    }

    pub fn config_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONFIG)?;
        Ok(table.get(key)?.map(|g| g.value().to_vec()))
    }

    pub fn config_set(&self, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CONFIG)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// `load(oid, at≤tid)` (§4.4): the greatest revision `serial ≤ at`, plus
    /// the next greater serial if one exists.
    pub fn load(&self, partition: u32, oid: Oid, at: Tid) -> Result<Option<Loaded>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJ)?;
        let lower = obj_by_oid_key(partition, oid, Tid::ZERO);
        let upper = obj_by_oid_key(partition, oid, at);
        let mut found = None;
        {
            let mut iter = table.range(lower.as_slice()..=upper.as_slice())?;
            while let Some(entry) = iter.next() {
                let (key, value) = entry?;
                let (tid, _) = unpack_oid_tid_from_obj_key(key.value());
                let row: ObjRow = rmp_serde::from_slice(value.value())?;
                found = Some((tid, row));
            }
        }
        let (serial, row) = match found {
            Some(v) => v,
            None => return Ok(None),
        };
        let next_upper = obj_by_oid_key(partition, oid, Tid::MAX);
        let next_lower = obj_by_oid_key(partition, oid, serial.next());
        let next_serial = {
            let mut iter = table.range(next_lower.as_slice()..=next_upper.as_slice())?;
            match iter.next() {
                Some(entry) => {
                    let (key, _) = entry?;
                    Some(unpack_oid_tid_from_obj_key(key.value()).0)
                }
                None => None,
            }
        };
        let data = match row.data_hash {
            Some(hash) => {
                let data_table = read_txn.open_table(DATA)?;
                let stored = data_table.get(hash.as_slice())?.ok_or_else(|| err("dangling data reference"))?;
                let dr: DataRow = rmp_serde::from_slice(stored.value())?;
                Some(dr.bytes)
            }
            None => None,
        };
        Ok(Some(Loaded {
            serial,
            next_serial,
            data,
            compression: row.compression,
            checksum: row.data_hash.unwrap_or([0u8; 20]),
        }))
    }

    /// `store(oid, serial, data, transaction)` (§4.4): stages into `tobj`
    /// and deduplicates into `data`. The caller compares the returned
    /// `latest` against the client's expected `serial` to detect conflict.
    pub fn store(
        &self,
        partition: u32,
        oid: Oid,
        serial: Option<Tid>,
        tid: Tid,
        data: Option<&[u8]>,
        compression: bool,
    ) -> Result<Stored> {
        // The "latest" serial considers both committed (`obj`) and staged
        // but not-yet-unlocked (`tobj`) revisions from *other* transactions:
        // a storage that already staged an earlier TID for this OID treats
        // a second store against the same OID as conflicting rather than
        // racing it to commit (§4.2 "A storage that already locked the OID
        // for an earlier TID delays its response... until that earlier TID
        // completes or aborts" — approximated here as an immediate conflict
        // rather than a queued retry).
        let latest = {
            let read_txn = self.db.begin_read()?;
            let lower = obj_by_oid_key(partition, oid, Tid::ZERO);
            let upper = obj_by_oid_key(partition, oid, Tid::MAX);
            let mut last = Tid::ZERO;
            {
                let table = read_txn.open_table(OBJ)?;
                let mut iter = table.range(lower.as_slice()..=upper.as_slice())?;
                while let Some(entry) = iter.next() {
                    let (key, _) = entry?;
                    last = last.max(unpack_oid_tid_from_obj_key(key.value()).0);
                }
            }
            {
                let table = read_txn.open_table(TOBJ)?;
                let mut iter = table.range(lower.as_slice()..=upper.as_slice())?;
                while let Some(entry) = iter.next() {
                    let (key, _) = entry?;
                    let staged_tid = unpack_oid_tid_from_obj_key(key.value()).0;
                    if staged_tid != tid {
                        last = last.max(staged_tid);
                    }
                }
            }
            last
        };
        let conflict = match serial {
            Some(expected) => latest != Tid::ZERO && latest != expected,
            None => latest != Tid::ZERO,
        };

        let write_txn = self.db.begin_write()?;
        let length = data.map(|d| d.len() as u64).unwrap_or(0);
        let hash = match data {
            Some(bytes) => {
                let hash = hash_of(bytes);
                let mut data_table = write_txn.open_table(DATA)?;
                if data_table.get(hash.as_slice())?.is_none() {
                    let row = DataRow { compression, bytes: bytes.to_vec() };
                    data_table.insert(hash.as_slice(), rmp_serde::to_vec(&row)?.as_slice())?;
                }
                Some(hash)
            }
            None => None,
        };
        {
            let mut tobj = write_txn.open_table(TOBJ)?;
            let row = ObjRow { data_hash: hash, value_tid: None, compression, length };
            let key = obj_by_oid_key(partition, oid, tid);
            tobj.insert(key.as_slice(), rmp_serde::to_vec(&row)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(Stored { latest, conflict })
    }

    /// `lock(tid)` (§4.4, §4.2): stamps the staged rows for `tid` as
    /// load-locked. Persists the transaction header so `unlock`/recovery
    /// can find it even across a restart.
    pub fn lock(&self, partition: u32, tid: Tid, oids: &[Oid], user: &str, description: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut ttrans = write_txn.open_table(TTRANS)?;
            let row = TransRow {
                oids: oids.to_vec(),
                user: user.to_string(),
                description: description.to_string(),
                extension: Vec::new(),
                packed: false,
                locked: true,
            };
            let key = trans_key(partition, tid);
            ttrans.insert(key.as_slice(), rmp_serde::to_vec(&row)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// `unlock(tid)` (§4.4): copies `tobj`/`ttrans` rows into `obj`/`trans`
    /// and clears the staging rows. Idempotent — a `tid` with no staged
    /// rows left is a no-op, since restart-recovery may re-drive this.
    pub fn unlock(&self, partition: u32, tid: Tid, oids: &[Oid]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let ttrans_row: Option<Vec<u8>> = {
                let ttrans = write_txn.open_table(TTRANS)?;
                let key = trans_key(partition, tid);
                ttrans.get(key.as_slice())?.map(|g| g.value().to_vec())
            };
            if let Some(bytes) = ttrans_row {
                let mut trans = write_txn.open_table(TRANS)?;
                let key = trans_key(partition, tid);
                trans.insert(key.as_slice(), bytes.as_slice())?;
                let mut ttrans = write_txn.open_table(TTRANS)?;
                ttrans.remove(key.as_slice())?;
            }
            for oid in oids {
                let key = obj_by_oid_key(partition, *oid, tid);
                let staged: Option<Vec<u8>> = {
                    let tobj = write_txn.open_table(TOBJ)?;
                    tobj.get(key.as_slice())?.map(|g| g.value().to_vec())
                };
                if let Some(bytes) = staged {
                    let mut obj = write_txn.open_table(OBJ)?;
                    obj.insert(key.as_slice(), bytes.as_slice())?;
                    let mut tobj = write_txn.open_table(TOBJ)?;
                    tobj.remove(key.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// `drop(tid)` (§4.4 abort path): discards staged rows without
    /// committing them.
    pub fn drop_txn(&self, partition: u32, tid: Tid, oids: &[Oid]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut ttrans = write_txn.open_table(TTRANS)?;
            ttrans.remove(trans_key(partition, tid).as_slice())?;
            let mut tobj = write_txn.open_table(TOBJ)?;
            for oid in oids {
                tobj.remove(obj_by_oid_key(partition, *oid, tid).as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Staged (`tobj`/`ttrans`) rows that never received `unlock` — surfaced
    /// during `VERIFYING` for the primary's quorum check (§4.1, §3).
    pub fn unfinished_transactions(&self, partition: u32) -> Result<Vec<Tid>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TTRANS)?;
        let prefix = crate::keys::partition_prefix(partition);
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&u64::MAX.to_be_bytes());
        let mut tids = Vec::new();
        let mut iter = table.range(prefix.as_slice()..=upper.as_slice())?;
        while let Some(entry) = iter.next() {
            let (key, _) = entry?;
            tids.push(crate::keys::unpack_tid_from_trans_key(key.value()));
        }
        Ok(tids)
    }

    /// `history(oid, offset, length)` (§4.4): most recent `(tid,
    /// length_of_value)` pairs, newest first, clipped at `pack_tid` by the
    /// caller (pack already deletes anything older).
    pub fn history(&self, partition: u32, oid: Oid, offset: usize, length: usize) -> Result<Vec<(Tid, u64)>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJ)?;
        let lower = obj_by_oid_key(partition, oid, Tid::ZERO);
        let upper = obj_by_oid_key(partition, oid, Tid::MAX);
        let mut rows = Vec::new();
        let mut iter = table.range(lower.as_slice()..=upper.as_slice())?;
        while let Some(entry) = iter.next() {
            let (key, value) = entry?;
            let (tid, _) = unpack_oid_tid_from_obj_key(key.value());
            let row: ObjRow = rmp_serde::from_slice(value.value())?;
            rows.push((tid, row.length));
        }
        rows.reverse();
        Ok(rows.into_iter().skip(offset).take(length).collect())
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }
}

pub(crate) const OBJ_TABLE: TableDefinition<&[u8], &[u8]> = OBJ;
pub(crate) const TRANS_TABLE: TableDefinition<&[u8], &[u8]> = TRANS;
pub(crate) const DATA_TABLE: TableDefinition<&[u8], &[u8]> = DATA;
pub(crate) const PT_TABLE: TableDefinition<&[u8], u8> = PT;

pub(crate) fn obj_row_from_bytes(bytes: &[u8]) -> Result<(Option<[u8; 20]>, Option<Tid>, bool, u64)> {
    let row: ObjRow = rmp_serde::from_slice(bytes)?;
    Ok((row.data_hash, row.value_tid, row.compression, row.length))
}

pub(crate) fn obj_row_to_bytes(data_hash: Option<[u8; 20]>, value_tid: Option<Tid>, compression: bool, length: u64) -> Result<Vec<u8>> {
    let row = ObjRow { data_hash, value_tid, compression, length };
    Ok(rmp_serde::to_vec(&row)?)
}

pub(crate) fn trans_row_from_bytes(bytes: &[u8]) -> Result<(Vec<Oid>, String, String, Vec<u8>, bool)> {
    let row: TransRow = rmp_serde::from_slice(bytes)?;
    Ok((row.oids, row.user, row.description, row.extension, row.packed))
}

pub(crate) fn mark_trans_packed(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut row: TransRow = rmp_serde::from_slice(bytes)?;
    row.packed = true;
    Ok(rmp_serde::to_vec(&row)?)
}

pub(crate) fn trans_row_to_bytes(
    oids: &[Oid],
    user: &str,
    description: &str,
    extension: &[u8],
    packed: bool,
    locked: bool,
) -> Result<Vec<u8>> {
    let row = TransRow {
        oids: oids.to_vec(),
        user: user.to_string(),
        description: description.to_string(),
        extension: extension.to_vec(),
        packed,
        locked,
    };
    Ok(rmp_serde::to_vec(&row)?)
}

pub(crate) fn data_row_to_bytes(compression: bool, bytes: &[u8]) -> Result<Vec<u8>> {
    let row = DataRow { compression, bytes: bytes.to_vec() };
    Ok(rmp_serde::to_vec(&row)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(&dir.path().join("store.redb"), 4).unwrap();
        (engine, dir)
    }

    #[test]
    fn store_then_lock_then_unlock_makes_data_loadable() {
        let (engine, _dir) = engine();
        let oid = Oid(1);
        let tid = Tid(100);
        let stored = engine.store(0, oid, None, tid, Some(b"hello"), false).unwrap();
        assert!(!stored.conflict);
        engine.lock(0, tid, &[oid], "alice", "first commit").unwrap();
        assert!(engine.load(0, oid, tid).unwrap().is_none(), "not visible until unlock");
        engine.unlock(0, tid, &[oid]).unwrap();
        let loaded = engine.load(0, oid, tid).unwrap().unwrap();
        assert_eq!(loaded.data.unwrap(), b"hello");
        assert_eq!(loaded.serial, tid);
        assert!(loaded.next_serial.is_none());
    }

    #[test]
    fn concurrent_store_reports_conflict_against_stale_serial() {
        let (engine, _dir) = engine();
        let oid = Oid(1);
        let t1 = Tid(10);
        engine.store(0, oid, None, t1, Some(b"a"), false).unwrap();
        engine.lock(0, t1, &[oid], "a", "").unwrap();
        engine.unlock(0, t1, &[oid]).unwrap();

        let t2 = Tid(20);
        let stored = engine.store(0, oid, Some(t1), t2, Some(b"b"), false).unwrap();
        assert!(!stored.conflict);

        let t3 = Tid(30);
        let stale = engine.store(0, oid, Some(t1), t3, Some(b"c"), false).unwrap();
        assert!(stale.conflict);
        assert_eq!(stale.latest, t2, "sees t2's in-flight stage, not just the committed t1");
    }

    #[test]
    fn dropped_transaction_leaves_no_trace() {
        let (engine, _dir) = engine();
        let oid = Oid(1);
        let tid = Tid(10);
        engine.store(0, oid, None, tid, Some(b"x"), false).unwrap();
        engine.drop_txn(0, tid, &[oid]).unwrap();
        engine.lock(0, tid, &[oid], "a", "").unwrap();
        // lock writes a ttrans row even if tobj was dropped; unlock then
        // finds nothing to copy for the oid.
        engine.unlock(0, tid, &[oid]).unwrap();
        assert!(engine.load(0, oid, tid).unwrap().is_none());
    }

    #[test]
    fn history_orders_newest_first_and_clips_with_offset_length() {
        let (engine, _dir) = engine();
        let oid = Oid(1);
        for (n, tid) in [(1u8, Tid(10)), (2, Tid(20)), (3, Tid(30))] {
            engine.store(0, oid, None, tid, Some(&[n]), false).unwrap();
            engine.lock(0, tid, &[oid], "a", "").unwrap();
            engine.unlock(0, tid, &[oid]).unwrap();
        }
        let history = engine.history(0, oid, 0, 2).unwrap();
        assert_eq!(history, vec![(Tid(30), 1), (Tid(20), 1)]);
    }
}
