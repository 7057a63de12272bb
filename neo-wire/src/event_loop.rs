use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use neo_base::Error;
use neo_proto::Frame;

use crate::conn::{ConnHandle, ConnState, Connection};

const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// Transport-level callbacks. A `Transport` knows nothing about partial
/// reads, write buffers, or mio tokens; it reacts to whole frames and
/// connection lifecycle events. Implemented one layer up by whatever is
/// dispatching packets for a given role (master, storage, client, admin).
pub trait Transport {
    fn on_accept(&mut self, token: Token, peer: SocketAddr);
    fn on_connect(&mut self, token: Token);
    fn on_frame(&mut self, token: Token, frame: Frame);
    fn on_closed(&mut self, token: Token);
    fn on_error(&mut self, token: Token, error: Error);
}

/// A non-blocking event loop driving any number of TCP connections plus,
/// optionally, a listening socket. One `EventLoop` per process thread that
/// owns connections (§4.3, §9): connections are never shared across
/// threads directly, only via [`ConnHandle`].
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    connections: HashMap<Token, Connection>,
    waker: Arc<Waker>,
    next_token: usize,
}

impl EventLoop {
    fn new(listener: Option<TcpListener>) -> Result<EventLoop, Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let mut this = EventLoop {
            poll,
            events: Events::with_capacity(1024),
            listener: None,
            connections: HashMap::new(),
            waker,
            next_token: 0,
        };
        if let Some(mut listener) = listener {
            this.poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
            this.listener = Some(listener);
        }
        Ok(this)
    }

    /// Binds and registers a listening socket; for master/storage/admin
    /// processes that accept inbound connections.
    pub fn bind(addr: SocketAddr) -> Result<EventLoop, Error> {
        let listener = TcpListener::bind(addr)?;
        EventLoop::new(Some(listener))
    }

    /// No listening socket; for client-only processes that only originate
    /// outbound connections.
    pub fn client_only() -> Result<EventLoop, Error> {
        EventLoop::new(None)
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Initiates an outbound connection; its `on_connect` fires once the
    /// handshake completes, which may be on a later `turn`.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<Token, Error> {
        let mut stream = TcpStream::connect(addr)?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        let conn = Connection::new(token, stream, Some(addr), self.waker.clone());
        self.connections.insert(token, conn);
        Ok(token)
    }

    pub fn handle(&self, token: Token) -> Option<ConnHandle> {
        self.connections.get(&token).map(Connection::handle)
    }

    pub fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
    }

    /// Runs one iteration: polls for readiness, services every triggered
    /// connection, then gives every connection a chance to flush (since a
    /// cross-thread send wakes the poller rather than flipping a
    /// writable-readiness bit on any particular connection).
    pub fn turn(&mut self, timeout: Option<Duration>, sink: &mut dyn Transport) -> Result<(), Error> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let triggered: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in triggered {
            if token == WAKER_TOKEN {
                continue;
            }
            if token == LISTENER_TOKEN {
                self.accept_all(sink);
                continue;
            }
            self.service(token, sink);
        }

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.flush(token, sink);
        }
        Ok(())
    }

    fn accept_all(&mut self, sink: &mut dyn Transport) {
        loop {
            let (mut stream, peer) = match self.listener.as_ref().unwrap().accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            };
            let token = self.alloc_token();
            if self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                .is_err()
            {
                continue;
            }
            let mut conn = Connection::new(token, stream, Some(peer), self.waker.clone());
            conn.state = ConnState::Connected;
            self.connections.insert(token, conn);
            sink.on_accept(token, peer);
        }
    }

    fn service(&mut self, token: Token, sink: &mut dyn Transport) {
        let was_connecting = matches!(self.connections.get(&token).map(|c| c.state), Some(ConnState::Connecting));
        let frames = match self.connections.get_mut(&token) {
            Some(conn) => {
                if was_connecting {
                    conn.state = ConnState::Connected;
                }
                conn.try_read_frames()
            }
            None => return,
        };
        if was_connecting {
            sink.on_connect(token);
        }
        match frames {
            Ok(frames) => {
                for frame in frames {
                    sink.on_frame(token, frame);
                }
            }
            Err(e) => {
                sink.on_error(token, e);
                self.close(token);
                sink.on_closed(token);
                return;
            }
        }
        let closed = matches!(
            self.connections.get(&token).map(|c| c.state),
            Some(ConnState::Closed) | Some(ConnState::Aborted)
        );
        if closed {
            self.close(token);
            sink.on_closed(token);
        } else {
            self.flush(token, sink);
        }
    }

    fn flush(&mut self, token: Token, sink: &mut dyn Transport) {
        let result = match self.connections.get_mut(&token) {
            Some(conn) => conn.try_flush(),
            None => return,
        };
        if let Err(e) = result {
            sink.on_error(token, e.into());
            self.close(token);
            sink.on_closed(token);
        }
    }
}
