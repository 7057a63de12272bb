//! Master role: primary election, cluster-state lifecycle, node membership,
//! partition-table maintenance, and the two-phase-commit coordinator
//! (§4.1, §4.2). Connection handling and dispatch live in `neo-wire` and
//! `neo-dispatch`; this crate holds the state those handlers mutate.

pub mod cluster;
pub mod election;
pub mod nodes;
pub mod pt;
pub mod txn;

pub use cluster::ClusterStateMachine;
pub use election::Election;
pub use nodes::NodeManager;
pub use pt::Assigner;
pub use txn::{Allocator, Coordinator, Transaction, TxnState, OID_BATCH_SIZE};
