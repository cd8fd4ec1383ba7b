//! Echo server policy.
//!
//! Every inbound chunk is queued straight back to the sender, and the
//! connection is hung up once the echoed bytes have been fully flushed.
//! One instance serves every connection; per-connection progress lives in
//! `EchoState` next to the connection itself.

use bytes::Bytes;
use std::io;
use tracing::{debug, warn};

use crate::reactor::{Connection, FlushNotice, Handler};

/// Stateless echo policy, shared across all connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoService;

/// Per-connection echo progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EchoState {
    #[default]
    AwaitingData,
    Echoing,
    Closing,
    Closed,
}

impl Handler for EchoService {
    type State = EchoState;

    fn on_data(&self, state: &mut EchoState, conn: &mut Connection, data: Bytes) {
        debug!(peer = %conn.peer(), bytes = data.len(), "echoing chunk");
        match state {
            EchoState::AwaitingData | EchoState::Echoing => {
                *state = EchoState::Echoing;
                conn.enqueue_write(data, FlushNotice::Notify);
            }
            // Anything arriving after the hang-up was requested goes down
            // with the connection.
            EchoState::Closing | EchoState::Closed => {}
        }
    }

    fn on_write_flushed(&self, state: &mut EchoState, conn: &mut Connection) {
        // Echo-and-hang-up: the reply is on the wire, close the connection.
        *state = EchoState::Closing;
        conn.close();
    }

    fn on_error(&self, state: &mut EchoState, err: &io::Error) {
        warn!(error = %err, "echo connection error");
        *state = EchoState::Closed;
    }

    fn on_closed(&self, state: &mut EchoState) {
        *state = EchoState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::ConnState;
    use mio::net::TcpStream;
    use std::io::Read;
    use std::time::Duration;

    fn pair() -> (Connection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer_addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let conn = Connection::accepted(TcpStream::from_std(accepted), peer_addr, 64 * 1024);
        (conn, peer)
    }

    #[test]
    fn echoes_one_chunk_then_closes() {
        let (mut conn, mut peer) = pair();
        let svc = EchoService;
        let mut state = EchoState::default();

        svc.on_data(&mut state, &mut conn, Bytes::from_static(b"Netty rocks!"));
        assert_eq!(state, EchoState::Echoing);

        let outcome = conn.flush_pending().unwrap();
        assert_eq!(outcome.completed, 1);
        svc.on_write_flushed(&mut state, &mut conn);
        assert_eq!(state, EchoState::Closing);
        assert_eq!(conn.state(), ConnState::Closed);

        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"Netty rocks!");
    }

    #[test]
    fn split_reads_echo_in_order_before_hanging_up() {
        // Transport delivered a 5-byte payload as two readable events of
        // 3 and 2 bytes before the first echo finished flushing.
        let (mut conn, mut peer) = pair();
        let svc = EchoService;
        let mut state = EchoState::default();

        svc.on_data(&mut state, &mut conn, Bytes::from_static(b"hel"));
        svc.on_data(&mut state, &mut conn, Bytes::from_static(b"lo"));
        assert_eq!(state, EchoState::Echoing);

        let outcome = conn.flush_pending().unwrap();
        assert_eq!(outcome.completed, 2);
        svc.on_write_flushed(&mut state, &mut conn);
        svc.on_write_flushed(&mut state, &mut conn);
        assert_eq!(conn.state(), ConnState::Closed);

        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn error_hook_marks_connection_dead() {
        let svc = EchoService;
        let mut state = EchoState::Echoing;
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        svc.on_error(&mut state, &err);
        assert_eq!(state, EchoState::Closed);
    }
}
