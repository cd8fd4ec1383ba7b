//! rebound: a minimal TCP echo server and client
//!
//! The server accepts connections, echoes each inbound chunk back to the
//! sender, and hangs up once the echo is flushed. The client connects,
//! sends one payload, and logs whatever comes back until the server-side
//! close ends the exchange.
//!
//! Connections are driven by explicit readiness-based reactors, one per
//! worker thread, each owning a disjoint set of connections.

mod client;
mod config;
mod echo;
mod reactor;
mod server;

use config::{Config, Role};
use echo::EchoService;
use server::{Server, ShutdownHandle};
use std::sync::OnceLock;
use tracing::info;
use tracing_subscriber::EnvFilter;

static SHUTDOWN: OnceLock<ShutdownHandle> = OnceLock::new();

extern "C" fn on_signal(_sig: libc::c_int) {
    if let Some(handle) = SHUTDOWN.get() {
        handle.shutdown();
    }
}

fn install_signal_handlers() {
    let handler: extern "C" fn(libc::c_int) = on_signal;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.role {
        Role::Server => run_server(config),
        Role::Client => run_client(config),
    }
}

fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        "starting echo server"
    );

    let server = Server::bind(&config, EchoService)?;
    let _ = SHUTDOWN.set(server.shutdown_handle());
    install_signal_handlers();

    server.run()?;
    Ok(())
}

fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(host = %config.host, port = config.port, "starting echo client");

    let received = client::run(&config)?;
    info!(bytes = received.len(), "exchange complete");
    Ok(())
}
