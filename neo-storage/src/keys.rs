//! Byte-key packing for the `redb` tables in [`crate::engine`]. Keys are
//! big-endian fixed-width concatenations so that lexicographic key order
//! (what `redb` range-scans in) matches numeric order — the same technique
//! `neo-proto::codec` uses for the wire header.

use neo_proto::{Oid, Tid};

/// `obj` primary key: `(partition, tid, oid)`, ordered so a range scan
/// across a partition visits transactions in commit order.
pub fn obj_key(partition: u32, tid: Tid, oid: Oid) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[0..4].copy_from_slice(&partition.to_be_bytes());
    key[4..12].copy_from_slice(&tid.0.to_be_bytes());
    key[12..20].copy_from_slice(&oid.0.to_be_bytes());
    key
}

/// Secondary index key: `(partition, oid, tid)`, ordered so the newest
/// revision of an OID sorts last — `load(oid, at)` range-scans backward
/// from `(partition, oid, at)`.
pub fn obj_by_oid_key(partition: u32, oid: Oid, tid: Tid) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[0..4].copy_from_slice(&partition.to_be_bytes());
    key[4..12].copy_from_slice(&oid.0.to_be_bytes());
    key[12..20].copy_from_slice(&tid.0.to_be_bytes());
    key
}

pub fn obj_by_oid_prefix(partition: u32, oid: Oid) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[0..4].copy_from_slice(&partition.to_be_bytes());
    key[4..12].copy_from_slice(&oid.0.to_be_bytes());
    key
}

/// `trans` primary key: `(partition, tid)`.
pub fn trans_key(partition: u32, tid: Tid) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[0..4].copy_from_slice(&partition.to_be_bytes());
    key[4..12].copy_from_slice(&tid.0.to_be_bytes());
    key
}

pub fn partition_prefix(partition: u32) -> [u8; 4] {
    partition.to_be_bytes()
}

pub fn unpack_oid_tid_from_obj_key(key: &[u8]) -> (Tid, Oid) {
    let tid = Tid(u64::from_be_bytes(key[4..12].try_into().unwrap()));
    let oid = Oid(u64::from_be_bytes(key[12..20].try_into().unwrap()));
    (tid, oid)
}

pub fn unpack_tid_from_trans_key(key: &[u8]) -> Tid {
    Tid(u64::from_be_bytes(key[4..12].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn obj_by_oid_keys_sort_by_ascending_tid_within_an_oid() {
        let a = obj_by_oid_key(0, Oid(5), Tid(1));
        let b = obj_by_oid_key(0, Oid(5), Tid(2));
        assert!(a < b);
    }

    #[test]
    fn prefix_matches_keys_for_that_oid_only() {
        let prefix = obj_by_oid_prefix(0, Oid(5));
        let key = obj_by_oid_key(0, Oid(5), Tid(99));
        assert_eq!(&key[..12], &prefix[..]);
        let other = obj_by_oid_key(0, Oid(6), Tid(1));
        assert_ne!(&other[..12], &prefix[..]);
    }
}
