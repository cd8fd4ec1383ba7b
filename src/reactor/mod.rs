//! Readiness-driven reactor core.
//!
//! One `Reactor` per worker thread, each owning a disjoint set of
//! connections. Shared abstractions:
//! - `Connection`: per-socket state machine and pending-write queue
//! - `Handler`: the per-connection policy seam (echo server, client)
//! - `ReactorHandle`: cross-thread handoff of accepted sockets and shutdown

mod connection;
mod event_loop;
mod handler;

pub use connection::{ConnState, Connection, FlushNotice};
pub use event_loop::{Reactor, ReactorHandle};
pub use handler::Handler;
