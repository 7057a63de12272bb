//! Storage-to-storage replication (§4.4 "Replication"): a replica catching
//! up an `OUT_OF_DATE` partition streams committed TIDs, then OIDs, from a
//! source peer, persisting its progress so the process is restartable.

use redb::ReadableTable;

use neo_base::Result;
use neo_proto::{Oid, Tid};

use crate::engine::{data_row_to_bytes, obj_row_to_bytes, trans_row_from_bytes, trans_row_to_bytes, Engine, DATA_TABLE, OBJ_TABLE, TRANS_TABLE};
use crate::keys::{obj_by_oid_key, obj_by_oid_prefix, partition_prefix, trans_key, unpack_oid_tid_from_obj_key, unpack_tid_from_trans_key};

/// A committed transaction header, as answered by `AskTransactionInformation`.
pub struct TransactionInfo {
    pub oids: Vec<Oid>,
    pub user: String,
    pub description: String,
    pub extension: Vec<u8>,
}

/// An object revision's payload, as answered by `AskObject`.
pub struct ObjectPayload {
    pub data: Option<Vec<u8>>,
    pub compression: bool,
}

/// Whatever a replica streams from: a peer storage over the wire in
/// production, or another in-process [`Engine`] in tests.
pub trait ReplicationSource {
    fn tids_from(&self, partition: u32, after: Tid, limit: u32) -> Result<Vec<Tid>>;
    fn transaction_info(&self, partition: u32, tid: Tid) -> Result<Option<TransactionInfo>>;
    fn oids_from(&self, partition: u32, after: Oid, limit: u32) -> Result<Vec<Oid>>;
    fn object_history_from(&self, partition: u32, oid: Oid, after: Tid, limit: u32) -> Result<Vec<Tid>>;
    fn object(&self, partition: u32, oid: Oid, serial: Tid) -> Result<Option<ObjectPayload>>;
}

/// Persisted progress for one partition's catch-up: the three cursors
/// named in §4.4 ("tid-cursor, oid-cursor, per-oid-serial-cursor").
#[derive(Clone, Copy, Debug, Default)]
pub struct Cursors {
    pub tid_cursor: Tid,
    pub oid_cursor: Oid,
}

const BATCH: u32 = 256;

impl Engine {
    fn cursor_key(partition: u32) -> String {
        format!("replicate/{partition}")
    }

    pub fn replication_cursor(&self, partition: u32) -> Result<Cursors> {
        match self.config_get(&Self::cursor_key(partition))? {
            Some(bytes) if bytes.len() == 16 => Ok(Cursors {
                tid_cursor: Tid(u64::from_be_bytes(bytes[0..8].try_into().unwrap())),
                oid_cursor: Oid(u64::from_be_bytes(bytes[8..16].try_into().unwrap())),
            }),
            _ => Ok(Cursors::default()),
        }
    }

    pub fn save_replication_cursor(&self, partition: u32, cursors: Cursors) -> Result<()> {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&cursors.tid_cursor.0.to_be_bytes());
        bytes.extend_from_slice(&cursors.oid_cursor.0.to_be_bytes());
        self.config_set(&Self::cursor_key(partition), &bytes)
    }

    pub fn has_trans(&self, partition: u32, tid: Tid) -> Result<bool> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(TRANS_TABLE)?;
        Ok(table.get(trans_key(partition, tid).as_slice())?.is_some())
    }

    /// Writes a replicated transaction header directly into `trans`,
    /// bypassing the `ttrans` staging area — replication copies already
    /// committed data, it doesn't participate in 2PC.
    pub fn replicate_trans_row(&self, partition: u32, tid: Tid, info: &TransactionInfo) -> Result<()> {
        let write_txn = self.db().begin_write()?;
        {
            let mut table = write_txn.open_table(TRANS_TABLE)?;
            let row = trans_row_to_bytes(&info.oids, &info.user, &info.description, &info.extension, false, true)?;
            table.insert(trans_key(partition, tid).as_slice(), row.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn local_object_serials(&self, partition: u32, oid: Oid) -> Result<Vec<Tid>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(OBJ_TABLE)?;
        let lower = obj_by_oid_key(partition, oid, Tid::ZERO);
        let upper = obj_by_oid_key(partition, oid, Tid::MAX);
        let mut serials = Vec::new();
        let mut iter = table.range(lower.as_slice()..=upper.as_slice())?;
        while let Some(entry) = iter.next() {
            let (key, _) = entry?;
            serials.push(unpack_oid_tid_from_obj_key(key.value()).0);
        }
        Ok(serials)
    }

    /// Writes a replicated object revision directly into `obj`.
    pub fn replicate_object(&self, partition: u32, oid: Oid, tid: Tid, payload: &ObjectPayload) -> Result<()> {
        let write_txn = self.db().begin_write()?;
        {
            let hash = match &payload.data {
                Some(bytes) => {
                    use sha1::{Digest, Sha1};
                    let mut hasher = Sha1::new();
                    hasher.update(bytes);
                    let hash: [u8; 20] = hasher.finalize().into();
                    let mut data_table = write_txn.open_table(DATA_TABLE)?;
                    if data_table.get(hash.as_slice())?.is_none() {
                        let row = data_row_to_bytes(payload.compression, bytes)?;
                        data_table.insert(hash.as_slice(), row.as_slice())?;
                    }
                    Some(hash)
                }
                None => None,
            };
            let mut table = write_txn.open_table(OBJ_TABLE)?;
            let length = payload.data.as_ref().map(|d| d.len() as u64).unwrap_or(0);
            let row = obj_row_to_bytes(hash, None, payload.compression, length)?;
            table.insert(obj_by_oid_key(partition, oid, tid).as_slice(), row.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl ReplicationSource for Engine {
    fn tids_from(&self, partition: u32, after: Tid, limit: u32) -> Result<Vec<Tid>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(TRANS_TABLE)?;
        let prefix = trans_key(partition, after.next());
        let upper = {
            let mut u = partition_prefix(partition).to_vec();
            u.extend_from_slice(&u64::MAX.to_be_bytes());
            u
        };
        let mut out = Vec::new();
        let mut iter = table.range(prefix.as_slice()..=upper.as_slice())?;
        while let Some(entry) = iter.next() {
            if out.len() as u32 >= limit {
                break;
            }
            let (key, _) = entry?;
            out.push(unpack_tid_from_trans_key(key.value()));
        }
        Ok(out)
    }

    fn transaction_info(&self, partition: u32, tid: Tid) -> Result<Option<TransactionInfo>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(TRANS_TABLE)?;
        match table.get(trans_key(partition, tid).as_slice())? {
            Some(g) => {
                let (oids, user, description, extension, _packed) = trans_row_from_bytes(g.value())?;
                Ok(Some(TransactionInfo { oids, user, description, extension }))
            }
            None => Ok(None),
        }
    }

    fn oids_from(&self, partition: u32, after: Oid, limit: u32) -> Result<Vec<Oid>> {
        let read_txn = self.db().begin_read()?;
        let table = read_txn.open_table(OBJ_TABLE)?;
        let prefix = partition_prefix(partition);
        let mut upper = prefix.to_vec();
        upper.extend_from_slice(&u64::MAX.to_be_bytes());
        upper.extend_from_slice(&u64::MAX.to_be_bytes());
        let lower = obj_by_oid_prefix(partition, Oid(after.0 + 1));
        let mut out = Vec::new();
        let mut last_oid = None;
        let mut iter = table.range(lower.as_slice()..=upper.as_slice())?;
        while let Some(entry) = iter.next() {
            let (key, _) = entry?;
            let (_, oid) = unpack_oid_tid_from_obj_key(key.value());
            if Some(oid) != last_oid {
                if out.len() as u32 >= limit {
                    break;
                }
                out.push(oid);
                last_oid = Some(oid);
            }
        }
        Ok(out)
    }

    fn object_history_from(&self, partition: u32, oid: Oid, after: Tid, limit: u32) -> Result<Vec<Tid>> {
        let all = self.local_object_serials(partition, oid)?;
        Ok(all.into_iter().filter(|t| *t > after).take(limit as usize).collect())
    }

    fn object(&self, partition: u32, oid: Oid, serial: Tid) -> Result<Option<ObjectPayload>> {
        Ok(self.load(partition, oid, serial)?.and_then(|loaded| {
            if loaded.serial == serial {
                Some(ObjectPayload { data: loaded.data, compression: loaded.compression })
            } else {
                None
            }
        }))
    }
}

/// Drives one partition's catch-up against `source` until it converges
/// (both the TID and OID streams return nothing new), persisting cursors
/// after every batch so the process can resume after a restart.
pub struct Replicator;

impl Replicator {
    /// Runs one batch. Returns `true` once the partition has caught up to
    /// the source (§4.4: "the replica notifies the master
    /// (`NotifyReplicationDone`)").
    pub fn run_once(target: &Engine, source: &dyn ReplicationSource, partition: u32) -> Result<bool> {
        let mut cursors = target.replication_cursor(partition)?;

        let tids = source.tids_from(partition, cursors.tid_cursor, BATCH)?;
        for tid in &tids {
            if !target.has_trans(partition, *tid)? {
                if let Some(info) = source.transaction_info(partition, *tid)? {
                    target.replicate_trans_row(partition, *tid, &info)?;
                }
            }
            cursors.tid_cursor = *tid;
        }

        let oids = source.oids_from(partition, cursors.oid_cursor, BATCH)?;
        for oid in &oids {
            let local: std::collections::HashSet<Tid> = target.local_object_serials(partition, *oid)?.into_iter().collect();
            let remote = source.object_history_from(partition, *oid, Tid::ZERO, u32::MAX)?;
            for serial in remote {
                if !local.contains(&serial) {
                    if let Some(payload) = source.object(partition, *oid, serial)? {
                        target.replicate_object(partition, *oid, serial, &payload)?;
                    }
                }
            }
            cursors.oid_cursor = *oid;
        }

        target.save_replication_cursor(partition, cursors)?;
        Ok(tids.is_empty() && oids.is_empty())
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

    fn commit(engine: &Engine, oid: Oid, tid: Tid, data: &[u8]) {
        engine.store(0, oid, None, tid, Some(data), false).unwrap();
        engine.lock(0, tid, &[oid], "u", "d").unwrap();
        engine.unlock(0, tid, &[oid]).unwrap();
    }

    #[test]
    fn replication_converges_and_copies_data() {
        let (source, _d1) = engine();
        let (target, _d2) = engine();
        commit(&source, Oid(4), Tid(7), b"x");

        let mut done = Replicator::run_once(&target, &source, 0).unwrap();
        while !done {
            done = Replicator::run_once(&target, &source, 0).unwrap();
        }

        let loaded = target.load(0, Oid(4), Tid(7)).unwrap().unwrap();
        assert_eq!(loaded.data.unwrap(), b"x");
        assert!(target.has_trans(0, Tid(7)).unwrap());
    }

    #[test]
    fn an_empty_source_converges_on_the_first_round() {
        let (source, _d1) = engine();
        let (target, _d2) = engine();
        assert!(Replicator::run_once(&target, &source, 0).unwrap());
    }
}
