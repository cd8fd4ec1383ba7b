//! Single-threaded readiness loop.
//!
//! One `Reactor` owns a poll instance and a disjoint set of connections;
//! exactly one readiness event is handled at a time, so no locking exists
//! inside a reactor. Parallelism happens across reactor shards, each on its
//! own worker thread. The only cross-thread input is a command channel
//! (connection adoption, shutdown) drained on a waker event.

use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::connection::{ConnState, Connection, ReadOutcome};
use super::handler::Handler;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;

enum Command {
    Adopt { stream: TcpStream, peer: SocketAddr },
    Shutdown,
}

/// Cross-thread handle to a running reactor.
pub struct ReactorHandle {
    cmd_tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Hand an accepted socket to the reactor. Ownership of the connection
    /// transfers to the reactor thread until it deregisters the socket.
    pub fn adopt(&self, stream: TcpStream, peer: SocketAddr) -> bool {
        if self.cmd_tx.send(Command::Adopt { stream, peer }).is_err() {
            return false;
        }
        self.waker.wake().is_ok()
    }

    /// Ask the reactor to drain its connections and stop.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.waker.wake();
    }
}

struct Entry<H: Handler> {
    conn: Connection,
    state: H::State,
}

/// A single-threaded event loop driving a set of connections through one
/// shared handler policy.
pub struct Reactor<H: Handler> {
    id: usize,
    poll: Poll,
    connections: Slab<Entry<H>>,
    handler: H,
    cmd_rx: Receiver<Command>,
    read_window: usize,
    grace: Duration,
    draining: bool,
    drain_deadline: Option<Instant>,
}

impl<H: Handler> Reactor<H> {
    /// Create a reactor and its cross-thread handle.
    ///
    /// `grace` bounds how long a draining reactor waits for in-flight writes
    /// before aborting what remains.
    pub fn new(
        id: usize,
        handler: H,
        read_window: usize,
        grace: Duration,
    ) -> io::Result<(Self, ReactorHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = mpsc::channel();

        let reactor = Self {
            id,
            poll,
            connections: Slab::new(),
            handler,
            cmd_rx,
            read_window,
            grace,
            draining: false,
            drain_deadline: None,
        };
        let handle = ReactorHandle { cmd_tx, waker };
        Ok((reactor, handle))
    }

    /// Initiate an outbound connection, registered for connect completion.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<usize> {
        let stream = TcpStream::connect(addr)?;
        let id = self.connections.insert(Entry {
            conn: Connection::connecting(stream, addr, self.read_window),
            state: H::State::default(),
        });
        let entry = &mut self.connections[id];
        match entry.conn.register(self.poll.registry(), Token(id)) {
            Ok(()) => {
                debug!(reactor = self.id, conn = id, peer = %addr, "connecting");
                Ok(id)
            }
            Err(e) => {
                self.connections.remove(id);
                Err(e)
            }
        }
    }

    /// Process readiness events until a shutdown command arrives, then drain
    /// connections within the grace period.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            let timeout = self
                .drain_deadline
                .map(|d| d.saturating_duration_since(Instant::now()));
            self.poll_once(&mut events, timeout)?;

            if self.draining {
                if self.connections.is_empty() {
                    debug!(reactor = self.id, "reactor drained");
                    return Ok(());
                }
                if self.drain_deadline.is_some_and(|d| Instant::now() >= d) {
                    warn!(
                        reactor = self.id,
                        open = self.connections.len(),
                        "drain grace expired, aborting remaining connections"
                    );
                    self.abort_all();
                    return Ok(());
                }
            }
        }
    }

    /// Process readiness events until every connection has closed, or fail
    /// with `TimedOut` at the deadline. Used by the client, which relies on
    /// the server-side close to end the exchange.
    pub fn run_until_idle(&mut self, timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.connections.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abort_all();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "exchange did not complete before deadline",
                ));
            }
            self.poll_once(&mut events, Some(remaining))?;
        }
        Ok(())
    }

    fn poll_once(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => self.drain_commands(),
                Token(id) => self.dispatch(id, event.is_readable(), event.is_writable()),
            }
        }
        Ok(())
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Adopt { stream, peer } => {
                    if self.draining {
                        debug!(reactor = self.id, peer = %peer, "draining, refusing connection");
                        continue;
                    }
                    if let Err(e) = self.adopt(stream, peer) {
                        warn!(reactor = self.id, peer = %peer, error = %e, "failed to adopt connection");
                    }
                }
                Command::Shutdown => self.begin_drain(),
            }
        }
    }

    fn adopt(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let id = self.connections.insert(Entry {
            conn: Connection::accepted(stream, peer, self.read_window),
            state: H::State::default(),
        });
        let entry = &mut self.connections[id];
        if let Err(e) = entry.conn.register(self.poll.registry(), Token(id)) {
            self.connections.remove(id);
            return Err(e);
        }
        debug!(reactor = self.id, conn = id, peer = %peer, "connection adopted");

        let entry = &mut self.connections[id];
        self.handler.on_open(&mut entry.state, &mut entry.conn);
        self.settle(id);
        Ok(())
    }

    fn begin_drain(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        self.drain_deadline = Some(Instant::now() + self.grace);
        debug!(
            reactor = self.id,
            open = self.connections.len(),
            "draining connections"
        );
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(entry) = self.connections.get_mut(id) {
                entry.conn.close();
            }
            self.settle(id);
        }
    }

    fn abort_all(&mut self) {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(mut entry) = self.connections.try_remove(id) {
                entry.conn.abort();
                entry.conn.deregister(self.poll.registry());
                self.handler.on_closed(&mut entry.state);
            }
        }
    }

    fn dispatch(&mut self, id: usize, readable: bool, writable: bool) {
        if !self.connections.contains(id) {
            return;
        }
        let result = self.drive(id, readable, writable);
        match result {
            Ok(()) => self.after_event(id),
            Err(e) => self.fail_connection(id, e),
        }
    }

    fn drive(&mut self, id: usize, readable: bool, writable: bool) -> io::Result<()> {
        if writable {
            self.handle_writable(id)?;
        }
        if readable {
            self.handle_readable(id)?;
        }
        Ok(())
    }

    fn handle_readable(&mut self, id: usize) -> io::Result<()> {
        // Drain until WouldBlock: readiness is edge-style, a partial drain
        // would lose the rest of the data until the next inbound byte.
        loop {
            let entry = &mut self.connections[id];
            match entry.conn.read_chunk()? {
                ReadOutcome::Data(chunk) => {
                    self.handler.on_data(&mut entry.state, &mut entry.conn, chunk);
                }
                ReadOutcome::WouldBlock | ReadOutcome::NotReading => break,
                ReadOutcome::Eof => {
                    debug!(reactor = self.id, conn = id, "peer closed");
                    entry.conn.close();
                    break;
                }
            }
        }
        self.flush_connection(id)
    }

    fn handle_writable(&mut self, id: usize) -> io::Result<()> {
        let entry = &mut self.connections[id];
        if entry.conn.state() == ConnState::Connecting {
            if !entry.conn.finish_connect()? {
                return Ok(());
            }
            debug!(reactor = self.id, conn = id, peer = %entry.conn.peer(), "connected");
            self.handler.on_open(&mut entry.state, &mut entry.conn);
        }
        self.flush_connection(id)
    }

    /// Flush the pending queue, firing flush notices in FIFO order. Loops
    /// because a notice handler may enqueue further writes or close.
    fn flush_connection(&mut self, id: usize) -> io::Result<()> {
        loop {
            let Some(entry) = self.connections.get_mut(id) else {
                return Ok(());
            };
            let outcome = entry.conn.flush_pending()?;
            if outcome.completed == 0 {
                return Ok(());
            }
            for _ in 0..outcome.completed {
                if let Some(entry) = self.connections.get_mut(id) {
                    self.handler.on_write_flushed(&mut entry.state, &mut entry.conn);
                }
            }
        }
    }

    /// Attempt a flush and re-sync interest after handler activity.
    fn settle(&mut self, id: usize) {
        if !self.connections.contains(id) {
            return;
        }
        match self.flush_connection(id) {
            Ok(()) => self.after_event(id),
            Err(e) => self.fail_connection(id, e),
        }
    }

    fn after_event(&mut self, id: usize) {
        let Some(entry) = self.connections.get_mut(id) else {
            return;
        };
        match entry.conn.sync_interest(self.poll.registry(), Token(id)) {
            Ok(true) => {}
            Ok(false) => self.remove_connection(id),
            Err(e) => self.fail_connection(id, e),
        }
    }

    fn remove_connection(&mut self, id: usize) {
        if let Some(mut entry) = self.connections.try_remove(id) {
            entry.conn.deregister(self.poll.registry());
            self.handler.on_closed(&mut entry.state);
            debug!(reactor = self.id, conn = id, "connection closed");
        }
    }

    /// A connection-scoped I/O error: report it to the handler, hard-close
    /// that one connection, and leave every other connection untouched.
    fn fail_connection(&mut self, id: usize, err: io::Error) {
        if let Some(mut entry) = self.connections.try_remove(id) {
            debug!(
                reactor = self.id,
                conn = id,
                error = %err,
                discarded = entry.conn.pending_bytes(),
                "connection error"
            );
            self.handler.on_error(&mut entry.state, &err);
            entry.conn.abort();
            entry.conn.deregister(self.poll.registry());
            self.handler.on_closed(&mut entry.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoService;
    use bytes::Bytes;
    use std::io::{Read, Write};
    use std::thread;

    struct SilentHandler;

    impl Handler for SilentHandler {
        type State = ();

        fn on_data(&self, _state: &mut (), _conn: &mut Connection, _data: Bytes) {}

        fn on_error(&self, _state: &mut (), _err: &io::Error) {}
    }

    #[test]
    fn adopted_connection_is_driven_by_handler() {
        let (mut reactor, handle) =
            Reactor::new(0, EchoService, 64 * 1024, Duration::from_millis(500)).unwrap();
        let join = thread::spawn(move || reactor.run());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, peer_addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        assert!(handle.adopt(TcpStream::from_std(accepted), peer_addr));

        peer.write_all(b"ping").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"ping");

        handle.shutdown();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn run_until_idle_times_out_when_peer_never_closes() {
        // Listener accepts but never writes and never closes.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = thread::spawn(move || listener.accept());

        let (mut reactor, _handle) =
            Reactor::new(0, SilentHandler, 1024, Duration::from_millis(100)).unwrap();
        reactor.connect(addr).unwrap();
        let err = reactor
            .run_until_idle(Duration::from_millis(200))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(hold);
    }
}
