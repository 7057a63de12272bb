use mio::Token;
use neo_base::Error;
use neo_proto::{ErrorCode, Frame, Packet};

/// What a handler does after looking at one inbound frame.
pub enum Action {
    /// Nothing further; the handler already enqueued any replies it wanted.
    Continue,
    /// Switch the connection to a new handler (a protocol milestone was
    /// reached, e.g. identification completed and verification begins).
    Switch(Box<dyn Handler>),
    /// The frame didn't belong in this phase: reply `ErrorPacket`, then
    /// abort and mark the peer broken (§4.3 "Handler switching").
    ProtocolError(&'static str),
}

/// One phase of a connection's protocol lifecycle (§9 "Handler
/// inheritance": rather than a base-handler/subclass hierarchy, each phase
/// is a concrete value implementing this trait; switching phase just swaps
/// the boxed value held by the dispatch table).
pub trait Handler: Send {
    /// Human-readable phase name, used in protocol-error messages and logs.
    fn name(&self) -> &'static str;

    /// Handles one inbound frame addressed to `token`. `outbox` collects
    /// frames this handler wants to send back on the same connection.
    fn on_frame(&mut self, token: Token, frame: Frame, outbox: &mut Vec<Frame>) -> Action;

    /// Called once when this handler becomes active for a connection (e.g.
    /// to send the first packet of a phase, such as `AskPrimary`).
    fn on_enter(&mut self, _token: Token, _outbox: &mut Vec<Frame>) {}
}

/// Builds the standard `ErrorPacket` frame for a protocol violation, reusing
/// the request id of the offending frame so correlation-based callers still
/// see a response.
pub fn protocol_error_frame(id: u32, message: &str) -> Frame {
    Frame::new(
        id,
        Packet::ErrorPacket(neo_proto::ErrorPacket {
            code: ErrorCode::ProtocolError,
            message: message.to_string(),
        }),
    )
}

/// Per-connection dispatch table: routes inbound frames to the handler
/// currently active for that connection, and applies `Switch`/
/// `ProtocolError` actions.
pub struct DispatchTable {
    active: Box<dyn Handler>,
}

impl DispatchTable {
    pub fn new(initial: Box<dyn Handler>) -> DispatchTable {
        DispatchTable { active: initial }
    }

    pub fn enter(&mut self, token: Token, outbox: &mut Vec<Frame>) {
        self.active.on_enter(token, outbox);
    }

    /// Feeds one frame to the active handler. Returns `Err` with a message
    /// when the frame constitutes a protocol error and the connection
    /// should be aborted; the caller is responsible for sending the
    /// `ErrorPacket` this function builds and tearing the connection down.
    pub fn dispatch(&mut self, token: Token, frame: Frame, outbox: &mut Vec<Frame>) -> Result<(), Error> {
        let id = frame.id;
        match self.active.on_frame(token, frame, outbox) {
            Action::Continue => Ok(()),
            Action::Switch(next) => {
                self.active = next;
                self.active.on_enter(token, outbox);
                Ok(())
            }
            Action::ProtocolError(message) => {
                outbox.push(protocol_error_frame(id, message));
                Err(neo_base::err(format!(
                    "protocol error in handler {}: {}",
                    self.active.name(),
                    message
                )))
            }
        }
    }
}
