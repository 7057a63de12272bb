//! Non-blocking transport (§4.3): a `mio`-driven event loop over TCP
//! connections, each framed with the `neo-proto` codec. This crate knows
//! about bytes, sockets, and frames; packet semantics and dispatch live in
//! `neo-dispatch` and above.

mod conn;
mod event_loop;

pub use conn::{ConnHandle, ConnState, Connection};
pub use event_loop::{EventLoop, Transport};
