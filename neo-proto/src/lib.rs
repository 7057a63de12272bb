//! Data model and wire vocabulary shared by every NEO process: identifiers
//! (§3), the TID calendar encoding, node/partition-table types, the cluster
//! state machine, the packet set, and the frame codec (§4.3).

mod cluster;
mod codec;
mod error_code;
mod ids;
mod node;
mod packet;
pub mod pt;
pub mod tid;

pub use cluster::{allowed_transition, ClusterState};
pub use codec::{peek_header, try_decode_frame, Frame, FrameHeader, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use error_code::ErrorCode;
pub use ids::{NodeRole, Oid, Ptid, Tid, Uuid};
pub use node::{NodeInfo, NodeState};
pub use packet::*;
pub use pt::{Cell, CellState, PartitionTable, PartitionTableDelta};
