use serde::{Deserialize, Serialize};

/// Wire-level error taxonomy (§6, §7 categories i/iv/v/vi). Carried inside an
/// `Error` packet; distinct from [`neo_base::Error`], which is this
/// process's internal, non-wire error type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotReady,
    OidNotFound,
    SerialNotFound,
    TidNotFound,
    ProtocolError,
    Timeout,
    BrokenNodeDisallowed,
    InternalError,
}
