//! Handler dispatch and request/response correlation (§4.3). This crate
//! bridges `neo-wire`'s frame-level transport and the role-specific
//! protocol logic in `neo-master`/`neo-storage`/`neo-client`/`neo-admin`:
//! the [`Handler`] trait and [`DispatchTable`] route inbound frames to the
//! phase currently active on a connection, and [`Dispatcher`] lets
//! application threads make blocking calls over the shared async
//! connection.

mod dispatcher;
mod handler;

pub use dispatcher::{Delivery, Dispatcher};
pub use handler::{protocol_error_frame, Action, DispatchTable, Handler};
