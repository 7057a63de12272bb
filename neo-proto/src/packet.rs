//! The packet vocabulary of §4.3/§6, grouped as: identification, election,
//! membership & partition table, transaction coordination, object I/O,
//! replication, and admin. Each group is a handful of small structs; the
//! [`packet_types!`] macro below ties them to a `PacketKind` wire tag and
//! generates the encode/decode dispatch that would otherwise be a long
//! hand-written match repeated twice.

use crate::error_code::ErrorCode;
use crate::ids::{Oid, Tid, Uuid};
use crate::node::NodeInfo;
use crate::pt::{PartitionTable, PartitionTableDelta};
use crate::ClusterState;
use neo_base::Error;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

macro_rules! packet_types {
    ( $( $kind:ident = $num:expr => $body:ty ),* $(,)? ) => {
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
        #[repr(u16)]
        pub enum PacketKind { $( $kind = $num, )* }

        impl PacketKind {
            pub fn from_u16(v: u16) -> Option<PacketKind> {
                match v {
                    $( $num => Some(PacketKind::$kind), )*
                    _ => None,
                }
            }

            pub fn as_u16(self) -> u16 {
                self as u16
            }
        }

        #[derive(Clone, Debug)]
        pub enum Packet { $( $kind($body), )* }

        impl Packet {
            pub fn kind(&self) -> PacketKind {
                match self {
                    $( Packet::$kind(_) => PacketKind::$kind, )*
                }
            }

            pub fn encode_payload(&self) -> Result<Vec<u8>, Error> {
                match self {
                    $( Packet::$kind(body) => Ok(rmp_serde::to_vec(body)?), )*
                }
            }

            pub fn decode_payload(kind: PacketKind, bytes: &[u8]) -> Result<Packet, Error> {
                match kind {
                    $( PacketKind::$kind => Ok(Packet::$kind(rmp_serde::from_slice(bytes)?)), )*
                }
            }
        }
    }
}

// ---- identification -------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestIdentification {
    pub uuid: Uuid,
    pub address: Option<SocketAddr>,
    pub cluster_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptIdentification {
    pub your_uuid: Uuid,
    pub num_partitions: u32,
    pub num_replicas: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendPartitionTable {
    pub table: PartitionTable,
}

// ---- election ---------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskPrimary;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerPrimary {
    pub primary: Option<Uuid>,
    pub known_masters: Vec<(Uuid, SocketAddr)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnnouncePrimaryMaster {
    pub uuid: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReelectPrimaryMaster;

// ---- membership & partition table -------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyNodeInformation {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyPartitionChanges {
    pub delta: PartitionTableDelta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskClusterState;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerClusterState {
    pub state: ClusterState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetClusterState {
    pub state: ClusterState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyClusterInformation {
    pub state: ClusterState,
}

// ---- transaction coordination -----------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskBeginTransaction;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerBeginTransaction {
    pub tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskNewOids {
    pub count: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerNewOids {
    pub oids: Vec<Oid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskStoreObject {
    pub oid: Oid,
    /// Serial the client last saw for this OID; `None` means "creation".
    pub serial: Option<Tid>,
    pub tid: Tid,
    pub data: Vec<u8>,
    pub compression: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerStoreObject {
    pub oid: Oid,
    /// `Some(latest)` on conflict; `None` means the store was accepted.
    pub conflict: Option<Tid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskFinishTransaction {
    pub tid: Tid,
    pub oids: Vec<Oid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerFinishTransaction {
    pub tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskAbortTransaction {
    pub tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerAbortTransaction {
    pub tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskLockInformation {
    pub tid: Tid,
    pub oids: Vec<Oid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerInformationLocked {
    pub tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyUnlockInformation {
    pub tid: Tid,
    /// `true` copies the staged rows into the permanent tables; `false`
    /// discards them (the abort path, which has no packet of its own).
    pub commit: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvalidateObjects {
    pub tid: Tid,
    pub oids: Vec<Oid>,
}

// ---- object I/O ---------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskObject {
    pub oid: Oid,
    /// Greatest revision at or before this TID is returned.
    pub at: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerObject {
    pub oid: Oid,
    pub serial: Tid,
    pub next_serial: Option<Tid>,
    pub data: Option<Vec<u8>>,
    pub compression: bool,
    pub checksum: [u8; 20],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskObjectHistory {
    pub oid: Oid,
    pub offset: u32,
    pub length: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerObjectHistory {
    pub oid: Oid,
    pub history: Vec<(Tid, u64)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskUndoTransaction {
    pub undone_tid: Tid,
    pub oid: Oid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerUndoTransaction {
    pub oid: Oid,
    /// Serial to pass as `serial` in the client's follow-up `store`.
    pub current_serial: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskPack {
    pub tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerPack {
    pub done: bool,
}

// ---- replication --------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskTidsFrom {
    pub partition: u32,
    pub after: Tid,
    pub limit: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerTidsFrom {
    pub tids: Vec<Tid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskTransactionInformation {
    pub tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerTransactionInformation {
    pub tid: Tid,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    pub packed: bool,
    pub oids: Vec<Oid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskOidsFrom {
    pub partition: u32,
    pub after: Oid,
    pub limit: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerOidsFrom {
    pub oids: Vec<Oid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskObjectHistoryFrom {
    pub oid: Oid,
    pub after: Tid,
    pub limit: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerObjectHistoryFrom {
    pub oid: Oid,
    pub serials: Vec<Tid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NotifyReplicationDone {
    pub partition: u32,
    pub tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskCheckTidRange {
    pub partition: u32,
    pub min_tid: Tid,
    pub max_tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerCheckTidRange {
    pub count: u64,
    pub hash: [u8; 20],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskCheckSerialRange {
    pub partition: u32,
    pub min_tid: Tid,
    pub max_tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerCheckSerialRange {
    pub count: u64,
    pub hash: [u8; 20],
}

// ---- admin --------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskPartitionList;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerPartitionList {
    pub table: PartitionTable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskNodeList;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerNodeList {
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskSetNodeState {
    pub uuid: Uuid,
    pub state: crate::node::NodeState,
    pub modify_partition_table: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerSetNodeState {
    pub uuid: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskAddPendingNodes {
    pub uuids: Vec<Uuid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerAddPendingNodes {
    pub added: Vec<Uuid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskTweakPartitionTable {
    pub excluded: Vec<Uuid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerTweakPartitionTable {
    pub delta: PartitionTableDelta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskDropNode {
    pub uuid: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerDropNode {
    pub uuid: Uuid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AskCheckReplicas {
    pub partition_sources: Vec<(u32, Uuid)>,
    pub min_tid: Tid,
    pub max_tid: Tid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnswerCheckReplicas {
    /// Partitions found to diverge from their reference source.
    pub divergent_partitions: Vec<u32>,
}

// ---- errors ---------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPacket {
    pub code: ErrorCode,
    pub message: String,
}

packet_types! {
    RequestIdentification = 0x01 => RequestIdentification,
    AcceptIdentification = 0x02 => AcceptIdentification,
    SendPartitionTable = 0x03 => SendPartitionTable,

    AskPrimary = 0x10 => AskPrimary,
    AnswerPrimary = 0x11 => AnswerPrimary,
    AnnouncePrimaryMaster = 0x12 => AnnouncePrimaryMaster,
    ReelectPrimaryMaster = 0x13 => ReelectPrimaryMaster,

    NotifyNodeInformation = 0x20 => NotifyNodeInformation,
    NotifyPartitionChanges = 0x21 => NotifyPartitionChanges,
    AskClusterState = 0x22 => AskClusterState,
    AnswerClusterState = 0x23 => AnswerClusterState,
    SetClusterState = 0x24 => SetClusterState,
    NotifyClusterInformation = 0x25 => NotifyClusterInformation,

    AskBeginTransaction = 0x30 => AskBeginTransaction,
    AnswerBeginTransaction = 0x31 => AnswerBeginTransaction,
    AskNewOids = 0x32 => AskNewOids,
    AnswerNewOids = 0x33 => AnswerNewOids,
    AskStoreObject = 0x34 => AskStoreObject,
    AnswerStoreObject = 0x35 => AnswerStoreObject,
    AskFinishTransaction = 0x36 => AskFinishTransaction,
    AnswerFinishTransaction = 0x37 => AnswerFinishTransaction,
    AskAbortTransaction = 0x38 => AskAbortTransaction,
    AnswerAbortTransaction = 0x39 => AnswerAbortTransaction,
    AskLockInformation = 0x3a => AskLockInformation,
    AnswerInformationLocked = 0x3b => AnswerInformationLocked,
    NotifyUnlockInformation = 0x3c => NotifyUnlockInformation,
    InvalidateObjects = 0x3d => InvalidateObjects,

    AskObject = 0x40 => AskObject,
    AnswerObject = 0x41 => AnswerObject,
    AskObjectHistory = 0x42 => AskObjectHistory,
    AnswerObjectHistory = 0x43 => AnswerObjectHistory,
    AskUndoTransaction = 0x44 => AskUndoTransaction,
    AnswerUndoTransaction = 0x45 => AnswerUndoTransaction,
    AskPack = 0x46 => AskPack,
    AnswerPack = 0x47 => AnswerPack,

    AskTidsFrom = 0x50 => AskTidsFrom,
    AnswerTidsFrom = 0x51 => AnswerTidsFrom,
    AskTransactionInformation = 0x52 => AskTransactionInformation,
    AnswerTransactionInformation = 0x53 => AnswerTransactionInformation,
    AskOidsFrom = 0x54 => AskOidsFrom,
    AnswerOidsFrom = 0x55 => AnswerOidsFrom,
    AskObjectHistoryFrom = 0x56 => AskObjectHistoryFrom,
    AnswerObjectHistoryFrom = 0x57 => AnswerObjectHistoryFrom,
    NotifyReplicationDone = 0x58 => NotifyReplicationDone,
    AskCheckTidRange = 0x59 => AskCheckTidRange,
    AnswerCheckTidRange = 0x5a => AnswerCheckTidRange,
    AskCheckSerialRange = 0x5b => AskCheckSerialRange,
    AnswerCheckSerialRange = 0x5c => AnswerCheckSerialRange,

    AskNodeList = 0x60 => AskNodeList,
    AnswerNodeList = 0x61 => AnswerNodeList,
    AskSetNodeState = 0x62 => AskSetNodeState,
    AnswerSetNodeState = 0x63 => AnswerSetNodeState,
    AskAddPendingNodes = 0x64 => AskAddPendingNodes,
    AnswerAddPendingNodes = 0x65 => AnswerAddPendingNodes,
    AskTweakPartitionTable = 0x66 => AskTweakPartitionTable,
    AnswerTweakPartitionTable = 0x67 => AnswerTweakPartitionTable,
    AskDropNode = 0x68 => AskDropNode,
    AnswerDropNode = 0x69 => AnswerDropNode,
    AskCheckReplicas = 0x6a => AskCheckReplicas,
    AnswerCheckReplicas = 0x6b => AnswerCheckReplicas,
    AskPartitionList = 0x6c => AskPartitionList,
    AnswerPartitionList = 0x6d => AnswerPartitionList,

    Error = 0xff => ErrorPacket,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn round_trips_through_payload_bytes() {
        let p = Packet::AskStoreObject(AskStoreObject {
            oid: Oid(7),
            serial: Some(Tid(3)),
            tid: Tid(4),
            data: b"hello".to_vec(),
            compression: false,
        });
        let kind = p.kind();
        assert_eq!(kind, PacketKind::AskStoreObject);
        let bytes = p.encode_payload().unwrap();
        let decoded = Packet::decode_payload(kind, &bytes).unwrap();
        match decoded {
            Packet::AskStoreObject(body) => {
                assert_eq!(body.oid, Oid(7));
                assert_eq!(body.data, b"hello");
            }
            other => panic!("wrong variant decoded: {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(PacketKind::from_u16(0xdead).is_none());
    }
}
