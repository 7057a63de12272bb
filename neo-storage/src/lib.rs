//! The storage role's metadata engine (§4.4): object/transaction tables,
//! pack, undo, replication, and partition-table integrity checks.

mod check;
mod engine;
mod keys;
mod pack;
mod replicator;
mod undo;

pub use check::{check_replica, digest_partition, Divergence, ReplicaDigest};
pub use engine::{Engine, Loaded, Stored};
pub use replicator::{Cursors, ObjectPayload, ReplicationSource, Replicator, TransactionInfo};
