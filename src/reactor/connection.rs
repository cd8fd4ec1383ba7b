//! Connection state machine and backpressure-aware write path.
//!
//! Each connection owns one non-blocking socket, a bounded inbound read
//! window, and a FIFO queue of pending writes. Partial reads and writes are
//! the normal case: the reactor re-arms interest and the connection resumes
//! where it left off.

use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};

/// Lifecycle of a connection.
///
/// Once Closed, every operation on the connection is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound connect issued, completion not yet observed.
    Connecting,
    /// Established; reading and writing.
    Open,
    /// Close requested with writes still queued; flushing, no more reads.
    Closing,
    /// Socket released.
    Closed,
}

/// Whether the handler hears about a pending write completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushNotice {
    /// Flush silently.
    Silent,
    /// Invoke `Handler::on_write_flushed` once the last byte reaches the
    /// kernel. On write failure the error hook fires instead.
    Notify,
}

/// An immutable byte sequence queued for write, flushed front-to-back.
struct PendingWrite {
    data: Bytes,
    written: usize,
    notice: FlushNotice,
}

/// Outcome of draining available inbound bytes.
pub(crate) enum ReadOutcome {
    /// A chunk of 1..=window bytes.
    Data(Bytes),
    /// Nothing more to read right now.
    WouldBlock,
    /// Peer closed its end of the stream.
    Eof,
    /// Connection is not in a readable state.
    NotReading,
}

/// Outcome of a flush attempt.
#[derive(Debug, Default)]
pub(crate) struct FlushOutcome {
    /// Number of `FlushNotice::Notify` writes that completed, in FIFO order.
    pub completed: usize,
    /// Whether the pending queue is now empty.
    pub drained: bool,
}

/// A single TCP connection owned by exactly one reactor.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnState,
    /// Bounded inbound window; one read never delivers more than this.
    read_buf: Box<[u8]>,
    pending: VecDeque<PendingWrite>,
    pending_bytes: usize,
    registered: Option<Interest>,
}

impl Connection {
    /// Wrap an accepted socket, already established.
    pub(crate) fn accepted(stream: TcpStream, peer: SocketAddr, read_window: usize) -> Self {
        Self::new(stream, peer, read_window, ConnState::Open)
    }

    /// Wrap an outbound socket with the connect still in flight.
    pub(crate) fn connecting(stream: TcpStream, peer: SocketAddr, read_window: usize) -> Self {
        Self::new(stream, peer, read_window, ConnState::Connecting)
    }

    fn new(stream: TcpStream, peer: SocketAddr, read_window: usize, state: ConnState) -> Self {
        Self {
            stream,
            peer,
            state,
            read_buf: vec![0u8; read_window].into_boxed_slice(),
            pending: VecDeque::new(),
            pending_bytes: 0,
            registered: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Total bytes queued but not yet handed to the kernel.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Append bytes to the pending-write queue.
    ///
    /// Writes are flushed in enqueue order, never reordered, never
    /// duplicated. Ignored once a close has been requested.
    pub fn enqueue_write(&mut self, data: Bytes, notice: FlushNotice) {
        match self.state {
            ConnState::Closing | ConnState::Closed => return,
            ConnState::Connecting | ConnState::Open => {}
        }
        self.pending_bytes += data.len();
        self.pending.push_back(PendingWrite {
            data,
            written: 0,
            notice,
        });
    }

    /// Request an orderly close: flush queued writes, then release the
    /// socket. Idempotent; a no-op on an already-closed connection.
    pub fn close(&mut self) {
        match self.state {
            ConnState::Closing | ConnState::Closed => {}
            _ if self.pending.is_empty() => self.release(),
            _ => self.state = ConnState::Closing,
        }
    }

    /// Hard-cancel: discard unflushed writes and release the socket now.
    pub fn abort(&mut self) {
        self.pending.clear();
        self.pending_bytes = 0;
        self.release();
    }

    fn release(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Read one chunk of available bytes, up to the read window.
    pub(crate) fn read_chunk(&mut self) -> io::Result<ReadOutcome> {
        if self.state != ConnState::Open {
            return Ok(ReadOutcome::NotReading);
        }
        match self.stream.read(&mut self.read_buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(Bytes::copy_from_slice(&self.read_buf[..n]))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Flush as much of the pending queue as the kernel will accept.
    ///
    /// Only the front write is ever in flight; a partial write stays at the
    /// front and resumes on the next writable event.
    pub(crate) fn flush_pending(&mut self) -> io::Result<FlushOutcome> {
        let mut outcome = FlushOutcome::default();
        if matches!(self.state, ConnState::Connecting | ConnState::Closed) {
            outcome.drained = self.pending.is_empty();
            return Ok(outcome);
        }

        while let Some(front) = self.pending.front_mut() {
            let remaining = &front.data[front.written..];
            if remaining.is_empty() {
                let done = self.pending.pop_front().expect("front exists");
                if done.notice == FlushNotice::Notify {
                    outcome.completed += 1;
                }
                continue;
            }
            match self.stream.write(remaining) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    ));
                }
                Ok(n) => {
                    front.written += n;
                    self.pending_bytes -= n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        outcome.drained = self.pending.is_empty();
        if outcome.drained && self.state == ConnState::Closing {
            self.release();
        }
        Ok(outcome)
    }

    /// Observe completion of an outbound connect after a writable event.
    ///
    /// Returns true once the connection is established; false while the
    /// connect is still in flight.
    pub(crate) fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(peer) => {
                self.peer = peer;
                self.state = ConnState::Open;
                Ok(true)
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Readiness this connection currently needs, or None once Closed.
    fn desired_interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::Connecting => Some(Interest::WRITABLE),
            ConnState::Open => {
                if self.pending.is_empty() {
                    Some(Interest::READABLE)
                } else {
                    Some(Interest::READABLE | Interest::WRITABLE)
                }
            }
            ConnState::Closing => Some(Interest::WRITABLE),
            ConnState::Closed => None,
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let interest = self
            .desired_interest()
            .unwrap_or(Interest::READABLE);
        registry.register(&mut self.stream, token, interest)?;
        self.registered = Some(interest);
        Ok(())
    }

    /// Re-arm interest to match the current state.
    ///
    /// Returns false when the connection is Closed and should be removed.
    pub(crate) fn sync_interest(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        match self.desired_interest() {
            Some(want) if self.registered != Some(want) => {
                registry.reregister(&mut self.stream, token, want)?;
                self.registered = Some(want);
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        if self.registered.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
    }
}
