use std::sync::Weak;
use std::time::Instant;

use crate::buffer::BufferList;

use super::handler::SocketHandler;

/// The per-connection protocol driver.
///
/// A [`SocketHandler`] owns exactly one processor at a time and feeds it
/// every batch of bytes the socket produces. The processor may be
/// replaced mid-connection by a protocol upgrade; an outgoing processor
/// is marked inactive so late callbacks become no-ops.
pub trait ConnectionProcessor: Send {
    /// Handles a batch of incoming bytes.
    ///
    /// The processor consumes from `buffer` through its cursor. Returning
    /// `true` means the batch was fully handled and the handler may drop
    /// it. `false` means the processor could not take the data yet, and
    /// the handler retains the unread remainder and retries on the next
    /// readiness tick.
    fn process(&mut self, buffer: &mut BufferList) -> bool;

    /// The peer closed its end of the connection.
    fn socket_closed(&mut self);

    /// The response for the current request has been fully handed to the
    /// write path. With `keep_alive` the processor readies itself for
    /// the next request; without it the connection is on its way out.
    fn response_ended(&mut self, keep_alive: bool);

    /// Whether a request is currently being parsed or handled. Idle
    /// sweeps never evict a connection that is in progress.
    fn in_progress(&self) -> bool;

    /// Absolute time after which an idle connection may be evicted.
    /// `None` means the connection is not idle-evictable right now.
    fn keep_alive_until(&self) -> Option<Instant>;

    /// Marks the processor dead: pending callbacks become no-ops and the
    /// idle deadline is cleared.
    fn mark_inactive(&mut self);

    /// Gives the processor its back-reference to the handler that owns
    /// it. Called once, when the handler is constructed or the processor
    /// is swapped in.
    fn set_handler(&mut self, handler: Weak<SocketHandler>);
}
