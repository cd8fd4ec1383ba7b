//! Echo client: connect, send one payload, record whatever comes back.
//!
//! The client does not close the connection itself; it relies on the
//! server-side hang-up, with a deadline as the backstop.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::reactor::{Connection, FlushNotice, Handler, Reactor};

/// Client policy, shareable across connections. The received log lives in
/// `ClientState`; it is published to the transcript sink when the
/// connection closes, where callers (and tests) can observe it.
#[derive(Clone)]
pub struct EchoClient {
    payload: Bytes,
    transcript: Arc<Mutex<Vec<u8>>>,
}

/// Per-connection accumulation of echoed bytes.
#[derive(Debug, Default)]
pub struct ClientState {
    received: Vec<u8>,
}

impl EchoClient {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            transcript: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared sink collecting the bytes received over closed connections.
    pub fn transcript(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.transcript)
    }
}

impl Handler for EchoClient {
    type State = ClientState;

    fn on_open(&self, _state: &mut ClientState, conn: &mut Connection) {
        debug!(peer = %conn.peer(), bytes = self.payload.len(), "sending payload");
        conn.enqueue_write(self.payload.clone(), FlushNotice::Silent);
    }

    fn on_data(&self, state: &mut ClientState, _conn: &mut Connection, data: Bytes) {
        info!("client received: {}", String::from_utf8_lossy(&data));
        state.received.extend_from_slice(&data);
    }

    fn on_error(&self, _state: &mut ClientState, err: &io::Error) {
        error!(error = %err, "client connection error");
    }

    fn on_closed(&self, state: &mut ClientState) {
        self.transcript
            .lock()
            .unwrap()
            .extend_from_slice(&state.received);
    }
}

/// Run one echo exchange and return every byte the server sent back.
pub fn run(config: &Config) -> io::Result<Vec<u8>> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let handler = EchoClient::new(config.payload.clone().into_bytes());
    let transcript = handler.transcript();

    let (mut reactor, _handle) = Reactor::new(
        0,
        handler,
        config.read_window,
        Duration::from_millis(config.grace_ms),
    )?;
    reactor.connect(addr)?;
    reactor.run_until_idle(Duration::from_millis(config.client_timeout_ms))?;

    let received = transcript.lock().unwrap().clone();
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use crate::echo::EchoService;
    use crate::server::Server;
    use std::thread;

    fn test_config(port: u16) -> Config {
        Config {
            role: Role::Client,
            host: "127.0.0.1".to_string(),
            port,
            workers: 1,
            read_window: 64 * 1024,
            grace_ms: 500,
            payload: "Netty rocks!".to_string(),
            client_timeout_ms: 2_000,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn client_round_trip_against_echo_server() {
        let server = Server::bind(&test_config(0), EchoService).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let join = thread::spawn(move || server.run());

        let received = run(&test_config(addr.port())).unwrap();
        assert_eq!(received, b"Netty rocks!");

        handle.shutdown();
        join.join().unwrap().unwrap();
    }
}
