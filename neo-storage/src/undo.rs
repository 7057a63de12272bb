//! `undo(oid, undone_tid)` (§4.4): the logical inverse of a committed
//! transaction, applied as a normal subsequent transaction by the client.
//! The storage's part is bookkeeping only — it never writes the new
//! revision itself.

use redb::ReadableTable;

use neo_base::Result;
use neo_proto::{Oid, Tid};

use crate::engine::{obj_row_from_bytes, obj_row_to_bytes, Engine, OBJ_TABLE};
use crate::keys::{obj_by_oid_key, unpack_oid_tid_from_obj_key};

impl Engine {
    /// Finds the revision immediately before `undone_tid`, rewrites any
    /// later revision that referenced `undone_tid`'s bytes (via
    /// `value_tid`) to point at that earlier revision instead, and returns
    /// the OID's current latest serial so the client can build its new
    /// `store` on top of it.
    pub fn undo(&self, partition: u32, oid: Oid, undone_tid: Tid) -> Result<Tid> {
        let write_txn = self.db().begin_write()?;
        let mut current_serial = Tid::ZERO;
        {
            let mut table = write_txn.open_table(OBJ_TABLE)?;
            let lower = obj_by_oid_key(partition, oid, Tid::ZERO);
            let upper = obj_by_oid_key(partition, oid, Tid::MAX);

            let mut revisions: Vec<(Tid, Option<[u8; 20]>, Option<Tid>, bool, u64)> = Vec::new();
            {
                let mut iter = table.range(lower.as_slice()..=upper.as_slice())?;
                while let Some(entry) = iter.next() {
                    let (key, value) = entry?;
                    let (tid, _) = unpack_oid_tid_from_obj_key(key.value());
                    let (hash, value_tid, compression, length) = obj_row_from_bytes(value.value())?;
                    revisions.push((tid, hash, value_tid, compression, length));
                    current_serial = current_serial.max(tid);
                }
            }

            let before = revisions
                .iter()
                .filter(|(tid, ..)| *tid < undone_tid)
                .map(|(tid, ..)| *tid)
                .max()
                .unwrap_or(Tid::ZERO);

            for (tid, hash, value_tid, compression, length) in &revisions {
                if *tid >= undone_tid && *value_tid == Some(undone_tid) {
                    let key = obj_by_oid_key(partition, oid, *tid);
                    let bytes = obj_row_to_bytes(*hash, Some(before), *compression, *length)?;
                    table.insert(key.as_slice(), bytes.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(current_serial)
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

    #[test]
    fn undo_reports_the_current_latest_serial() {
        let (engine, _dir) = engine();
        let oid = Oid(1);
        engine.store(0, oid, None, Tid(10), Some(b"a"), false).unwrap();
        engine.lock(0, Tid(10), &[oid], "u", "").unwrap();
        engine.unlock(0, Tid(10), &[oid]).unwrap();
        engine.store(0, oid, Some(Tid(10)), Tid(20), Some(b"b"), false).unwrap();
        engine.lock(0, Tid(20), &[oid], "u", "").unwrap();
        engine.unlock(0, Tid(20), &[oid]).unwrap();

        let current = engine.undo(0, oid, Tid(10)).unwrap();
        assert_eq!(current, Tid(20));
    }
}
