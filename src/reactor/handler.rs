//! The per-connection policy seam.
//!
//! A `Handler` is a stateless policy object shared by every connection on a
//! reactor. All per-connection mutable state lives in `Handler::State`, which
//! the reactor stores next to the `Connection` and passes back into each
//! callback. This makes a handler safely reusable across connections by
//! construction.

use bytes::Bytes;
use std::io;

use super::connection::Connection;

/// Connection lifecycle callbacks, invoked from the owning reactor thread.
///
/// Callbacks must not block: one reactor drives every connection it owns, so
/// a blocked callback stalls all of them. All socket I/O goes through the
/// `Connection` (non-blocking, resumed on readiness).
pub trait Handler: Send + 'static {
    /// Per-connection mutable state, created when the connection is adopted.
    type State: Default + Send + 'static;

    /// The connection transitioned to Open: an accepted socket was adopted,
    /// or an outbound connect completed.
    fn on_open(&self, state: &mut Self::State, conn: &mut Connection) {
        let _ = (state, conn);
    }

    /// A chunk of inbound bytes arrived. Chunk boundaries follow the
    /// transport's reads and carry no message framing.
    fn on_data(&self, state: &mut Self::State, conn: &mut Connection, data: Bytes);

    /// A pending write enqueued with `FlushNotice::Notify` was fully handed
    /// to the kernel. Fires exactly once per noticed write, in enqueue order.
    fn on_write_flushed(&self, state: &mut Self::State, conn: &mut Connection) {
        let _ = (state, conn);
    }

    /// An I/O error occurred on the connection. The reactor force-closes the
    /// connection after this hook returns; unflushed writes are discarded.
    fn on_error(&self, state: &mut Self::State, err: &io::Error);

    /// The connection reached Closed and is being released.
    fn on_closed(&self, state: &mut Self::State) {
        let _ = state;
    }
}
