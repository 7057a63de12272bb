use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::Token;
use neo_proto::Frame;

/// What a blocking caller receives: the frame if one arrived before the
/// connection was lost or the wait timed out, `None` otherwise (§4.3
/// "Dispatcher... delivers (connection, nil) sentinels").
pub type Delivery = Option<Frame>;

struct Waiter {
    token: Token,
    sender: Sender<Delivery>,
}

/// Correlates outstanding requests with the application threads waiting on
/// their answers. A single poll thread owns all I/O; application threads
/// register a `(connection, request-id, queue)` triple before sending,
/// then block on the queue (§4.3 "Dispatcher (client-side blocking
/// façade)").
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Mutex<HashMap<u32, Waiter>>>,
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new()
    }
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher { inner: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Registers interest in the answer to `request_id` on `token`, returning
    /// the receiving half of the channel the poll thread will deliver to.
    pub fn register(&self, token: Token, request_id: u32) -> Receiver<Delivery> {
        let (sender, receiver) = mpsc::channel();
        self.inner.lock().unwrap().insert(request_id, Waiter { token, sender });
        receiver
    }

    /// Blocks the calling thread for up to `timeout` waiting on `receiver`.
    /// On timeout the request slot is forgotten (a late answer, if any,
    /// will be silently dropped rather than treated as unexpected) and
    /// `None` is returned.
    pub fn wait(&self, request_id: u32, receiver: Receiver<Delivery>, timeout: Duration) -> Delivery {
        match receiver.recv_timeout(timeout) {
            Ok(delivery) => delivery,
            Err(_) => {
                self.forget(request_id);
                None
            }
        }
    }

    /// Called by the poll thread when a reply with `request_id` arrives.
    /// Unknown or already-forgotten ids are silently ignored — a forgotten
    /// request's late answer is not an unexpected packet.
    pub fn deliver(&self, request_id: u32, frame: Frame) {
        if let Some(waiter) = self.inner.lock().unwrap().remove(&request_id) {
            let _ = waiter.sender.send(Some(frame));
        }
    }

    /// Called by the poll thread when `token`'s connection is lost: every
    /// waiter registered against that connection receives a `None`
    /// sentinel, unblocking it with a failure.
    pub fn fail_connection(&self, token: Token) {
        let mut inner = self.inner.lock().unwrap();
        let dead: Vec<u32> = inner
            .iter()
            .filter(|(_, w)| w.token == token)
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(waiter) = inner.remove(&id) {
                let _ = waiter.sender.send(None);
            }
        }
    }

    /// Marks a request as no longer interesting to its caller without
    /// blocking on its answer. A subsequent `deliver` for the same id is a
    /// no-op.
    pub fn forget(&self, request_id: u32) {
        self.inner.lock().unwrap().remove(&request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neo_proto::{AskPrimary, Packet};
    use test_log::test;

    fn frame() -> Frame {
        Frame::new(7, Packet::AskPrimary(AskPrimary))
    }

    #[test]
    fn delivered_answer_reaches_waiter() {
        let dispatcher = Dispatcher::new();
        let receiver = dispatcher.register(Token(1), 7);
        dispatcher.deliver(7, frame());
        let delivery = dispatcher.wait(7, receiver, Duration::from_secs(1));
        assert!(delivery.is_some());
    }

    #[test]
    fn connection_loss_sends_sentinel_to_all_its_waiters() {
        let dispatcher = Dispatcher::new();
        let r1 = dispatcher.register(Token(1), 7);
        let r2 = dispatcher.register(Token(1), 8);
        let r3 = dispatcher.register(Token(2), 9);
        dispatcher.fail_connection(Token(1));
        assert!(dispatcher.wait(7, r1, Duration::from_millis(50)).is_none());
        assert!(dispatcher.wait(8, r2, Duration::from_millis(50)).is_none());
        dispatcher.deliver(9, frame());
        assert!(dispatcher.wait(9, r3, Duration::from_secs(1)).is_some());
    }

    #[test]
    fn forgotten_requests_silently_drop_late_answers() {
        let dispatcher = Dispatcher::new();
        let receiver = dispatcher.register(Token(1), 7);
        dispatcher.forget(7);
        dispatcher.deliver(7, frame());
        assert!(dispatcher.wait(7, receiver, Duration::from_millis(50)).is_none());
    }

    #[test]
    fn timed_out_wait_forgets_the_slot() {
        let dispatcher = Dispatcher::new();
        let receiver = dispatcher.register(Token(1), 7);
        let delivery = dispatcher.wait(7, receiver, Duration::from_millis(10));
        assert!(delivery.is_none());
        assert_eq!(dispatcher.inner.lock().unwrap().len(), 0);
    }
}
