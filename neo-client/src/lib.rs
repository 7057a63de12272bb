//! The client library (§4.5): connection/cache/scratchpad model and the
//! embedding interface a host database layer drives.

mod cache;
mod client;
mod net;
mod txn;

pub use cache::ObjectCache;
pub use client::{Backend, Client, ConflictResolver, NeverResolve, StoreReply};
pub use net::NetBackend;
pub use txn::{PendingStore, Scratchpad, TxnState};
