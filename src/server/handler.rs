use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::io::Interest;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::buffer::BufferList;

use super::manager::ConnectionManager;
use super::processor::ConnectionProcessor;
use super::socket::Socket;

/// How long to wait before retrying a buffer the processor refused.
const DEFERRED_RETRY_TICK: Duration = Duration::from_millis(50);

const READ_CHUNK_SIZE: usize = 16 * 1024;

/// The per-connection I/O adapter.
///
/// Owns the socket and its read/write buffers, and feeds every batch of
/// incoming bytes to the current [`ConnectionProcessor`]. All socket I/O
/// is non-blocking: reads drain until `WouldBlock`, writes that cannot
/// complete are buffered and flushed when the socket becomes writable
/// again. A close requested while writes are pending is deferred until
/// the write buffer drains.
pub struct SocketHandler {
    socket: Socket,
    key: i32,
    remote: String,
    processor: Mutex<Box<dyn ConnectionProcessor>>,
    pending_swap: Mutex<Option<Box<dyn ConnectionProcessor>>>,
    read_pending: Mutex<BufferList>,
    write_state: Mutex<WriteState>,
    wake_writer: Notify,
    wake_reader: Notify,
    closed: AtomicBool,
    read_closed: AtomicBool,
    manager: Weak<ConnectionManager>,
}

struct WriteState {
    buffer: Vec<u8>,
    cursor: usize,
    preparing_to_close: bool,
}

impl SocketHandler {
    pub(crate) fn new(
        socket: Socket,
        mut processor: Box<dyn ConnectionProcessor>,
        manager: Weak<ConnectionManager>,
    ) -> Arc<SocketHandler> {
        let key = socket.key();
        let remote = socket.remote_address();
        let handler = Arc::new(SocketHandler {
            socket,
            key,
            remote,
            // placeholder swapped below, once the Arc exists for the
            // processor's back-reference
            processor: Mutex::new(Box::new(NullProcessor)),
            pending_swap: Mutex::new(None),
            read_pending: Mutex::new(BufferList::new()),
            write_state: Mutex::new(WriteState {
                buffer: Vec::new(),
                cursor: 0,
                preparing_to_close: false,
            }),
            wake_writer: Notify::new(),
            wake_reader: Notify::new(),
            closed: AtomicBool::new(false),
            read_closed: AtomicBool::new(false),
            manager,
        });
        processor.set_handler(Arc::downgrade(&handler));
        *handler.processor.lock().unwrap() = processor;
        handler
    }

    pub(crate) fn key(&self) -> i32 {
        self.key
    }

    /// The remote endpoint, for logs.
    pub fn remote_address(&self) -> &str {
        &self.remote
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drives the connection: waits for socket readiness and dispatches
    /// read/write events until the handler closes.
    pub(crate) async fn run(self: Arc<Self>) {
        trace!("connection {} open ({})", self.key, self.remote);
        while !self.is_closed() {
            let want_write = {
                let ws = self.write_state.lock().unwrap();
                ws.cursor < ws.buffer.len() || ws.preparing_to_close
            };
            // once the peer has shut down its read side, readable
            // readiness would fire forever; wait only on the write path
            let interest = if self.read_closed.load(Ordering::SeqCst) {
                Interest::WRITABLE
            } else if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            tokio::select! {
                ready = self.socket.ready(interest) => {
                    match ready {
                        Ok(ready) => {
                            if ready.is_writable() {
                                self.on_writable();
                            }
                            if (ready.is_readable() || ready.is_read_closed())
                                && !self.read_closed.load(Ordering::SeqCst)
                            {
                                self.on_readable();
                            }
                        }
                        Err(e) => {
                            debug!("readiness wait failed on {}: {}", self.remote, e);
                            self.close();
                        }
                    }
                }
                _ = self.wake_writer.notified() => {
                    self.on_writable();
                }
                _ = self.wake_reader.notified() => {
                    self.deliver();
                }
                _ = tokio::time::sleep(DEFERRED_RETRY_TICK), if self.has_deferred() => {
                    self.deliver();
                }
            }
        }
        // teardown: the driver owns the processor's last rites so that
        // close() stays callable from inside a process() call
        self.processor.lock().unwrap().mark_inactive();
        if let Some(manager) = self.manager.upgrade() {
            manager.remove(self.key);
        }
        trace!("connection {} closed", self.key);
    }

    fn has_deferred(&self) -> bool {
        self.read_pending.lock().unwrap().remaining() > 0
    }

    /// Reads until the socket would block or reaches EOF, then hands the
    /// accumulated bytes to the processor.
    fn on_readable(&self) {
        let mut eof = false;
        {
            let mut pending = self.read_pending.lock().unwrap();
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            loop {
                match self.socket.try_read(&mut chunk) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        trace!("read {} bytes from {}", n, self.remote);
                        pending.append(&chunk[..n]);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("read error from {}: {}", self.remote, e);
                        drop(pending);
                        self.close();
                        return;
                    }
                }
            }
        }
        self.deliver();
        if eof {
            trace!("read eof from {}", self.remote);
            self.read_closed.store(true, Ordering::SeqCst);
            self.processor.lock().unwrap().socket_closed();
            self.prepare_to_close();
        }
    }

    /// Feeds retained bytes to the current processor. If the processor
    /// refuses (`false`), the remainder is kept for a later retry. A
    /// processor swap scheduled during processing is installed here, and
    /// leftover bytes are re-offered to the new processor.
    fn deliver(&self) {
        loop {
            {
                let mut pending = self.read_pending.lock().unwrap();
                if pending.remaining() == 0 {
                    pending.reset();
                    return;
                }
                let processed = self.processor.lock().unwrap().process(&mut pending);
                if processed {
                    if pending.remaining() == 0 {
                        pending.reset();
                    } else {
                        compact(&mut pending);
                    }
                } else {
                    compact(&mut pending);
                }
            }
            if !self.install_pending_swap() {
                return;
            }
            // a new processor took over; offer it the leftover bytes
        }
    }

    /// Flushes the write buffer with one non-blocking write. On full
    /// drain, completes any deferred close.
    fn on_writable(&self) {
        let mut should_close = false;
        {
            let mut ws = self.write_state.lock().unwrap();
            while ws.cursor < ws.buffer.len() {
                match self.socket.try_write(&ws.buffer[ws.cursor..]) {
                    Ok(n) => {
                        trace!("flushed {} bytes to {}", n, self.remote);
                        ws.cursor += n;
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("write error to {}: {}", self.remote, e);
                        should_close = true;
                        break;
                    }
                }
            }
            if ws.cursor >= ws.buffer.len() {
                ws.buffer.clear();
                ws.cursor = 0;
                if ws.preparing_to_close {
                    should_close = true;
                }
            }
        }
        if should_close {
            self.close();
        }
    }

    /// Queues bytes for the peer. Attempts an immediate non-blocking
    /// write when nothing is already queued; whatever does not fit is
    /// buffered and flushed on the next writable event. Never blocks.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() || self.is_closed() {
            return;
        }
        let mut broken = false;
        let mut needs_flush = false;
        {
            let mut ws = self.write_state.lock().unwrap();
            let mut written = 0;
            if ws.cursor >= ws.buffer.len() {
                ws.buffer.clear();
                ws.cursor = 0;
                loop {
                    match self.socket.try_write(&data[written..]) {
                        Ok(0) => break,
                        Ok(n) => {
                            written += n;
                            if written == data.len() {
                                break;
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!("write error to {}: {}", self.remote, e);
                            broken = true;
                            break;
                        }
                    }
                }
            }
            if !broken && written < data.len() {
                ws.buffer.extend_from_slice(&data[written..]);
                needs_flush = true;
            }
        }
        if broken {
            self.close();
        } else if needs_flush {
            self.wake_writer.notify_one();
        }
    }

    /// Closes now if the write buffer is drained, otherwise flags the
    /// handler to close as soon as it drains.
    pub fn prepare_to_close(&self) {
        let drained = {
            let mut ws = self.write_state.lock().unwrap();
            if ws.cursor >= ws.buffer.len() {
                true
            } else {
                ws.preparing_to_close = true;
                false
            }
        };
        if drained {
            self.close();
        } else {
            self.wake_writer.notify_one();
        }
    }

    /// Tears the connection down: wakes the driver, which unsubscribes,
    /// marks the processor inactive, and releases the socket. Safe to
    /// call from inside the processor's own `process`.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wake_writer.notify_one();
        self.wake_reader.notify_one();
    }

    /// Tells the current processor that the in-flight response has been
    /// fully written. Called from delegate workers, never from inside
    /// `process`.
    pub(crate) fn response_ended(&self, keep_alive: bool) {
        self.processor.lock().unwrap().response_ended(keep_alive);
    }

    /// Schedules `new_processor` to replace the current one as soon as
    /// the in-flight `process` call returns. The outgoing processor must
    /// already have been marked inactive by its own logic.
    pub fn schedule_processor_swap(&self, new_processor: Box<dyn ConnectionProcessor>) {
        *self.pending_swap.lock().unwrap() = Some(new_processor);
    }

    fn install_pending_swap(&self) -> bool {
        let mut slot = self.pending_swap.lock().unwrap();
        if let Some(mut new_processor) = slot.take() {
            drop(slot);
            // the weak back-reference needs an Arc; recover it from the
            // manager's map
            if let Some(manager) = self.manager.upgrade() {
                if let Some(me) = manager.handler(self.key) {
                    new_processor.set_handler(Arc::downgrade(&me));
                }
            }
            let mut current = self.processor.lock().unwrap();
            current.mark_inactive();
            *current = new_processor;
            debug!("processor swapped on {}", self.remote);
            true
        } else {
            false
        }
    }

    /// Asks the driver to re-offer any retained bytes to the processor.
    pub(crate) fn nudge_read(&self) {
        self.wake_reader.notify_one();
    }

    /// Whether the idle sweep may evict this connection at `now`.
    pub(crate) fn idle_past(&self, now: Instant) -> bool {
        let processor = self.processor.lock().unwrap();
        if processor.in_progress() {
            return false;
        }
        match processor.keep_alive_until() {
            Some(deadline) => now > deadline,
            None => false,
        }
    }
}

impl std::fmt::Debug for SocketHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketHandler")
            .field("key", &self.key)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Moves a buffer's unread remainder to its front so retained bytes do
/// not accumulate a dead prefix.
fn compact(pending: &mut BufferList) {
    if pending.remaining() == 0 {
        pending.reset();
        return;
    }
    let rest = pending.snapshot();
    pending.reset();
    pending.append(&rest);
}

/// Stand-in installed while the real processor receives its handler
/// back-reference during construction.
struct NullProcessor;

impl ConnectionProcessor for NullProcessor {
    fn process(&mut self, _buffer: &mut BufferList) -> bool {
        false
    }
    fn socket_closed(&mut self) {}
    fn response_ended(&mut self, _keep_alive: bool) {}
    fn in_progress(&self) -> bool {
        false
    }
    fn keep_alive_until(&self) -> Option<Instant> {
        None
    }
    fn mark_inactive(&mut self) {}
    fn set_handler(&mut self, _handler: Weak<SocketHandler>) {}
}
