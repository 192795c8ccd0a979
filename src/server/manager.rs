use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::handler::SocketHandler;
use super::processor::ConnectionProcessor;
use super::response;
use super::socket::Socket;
use super::ServerOptions;

/// How often the idle sweep actually walks the connection map. The
/// source library wavers between 5 and 60 seconds; the smaller value is
/// used here for eviction responsiveness.
pub(crate) const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Owns every live connection handler of a server.
///
/// Handlers are keyed by their socket's descriptor. The manager enforces
/// the connection limit at accept time, evicts idle keep-alive
/// connections past their deadline, and force-closes everything on
/// [`stop`](ConnectionManager::stop).
pub struct ConnectionManager {
    connections: RwLock<HashMap<i32, Arc<SocketHandler>>>,
    last_sweep: Mutex<Instant>,
    options: Arc<ServerOptions>,
    stopped: AtomicBool,
}

impl ConnectionManager {
    pub(crate) fn new(options: Arc<ServerOptions>) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager {
            connections: RwLock::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
            options,
            stopped: AtomicBool::new(false),
        })
    }

    /// Takes ownership of a freshly accepted socket.
    ///
    /// Over the connection limit, the configured rejection response is
    /// written best-effort and the socket is dropped. Otherwise a
    /// handler is constructed around the socket and its driver task is
    /// spawned. Every accept also gives the idle sweep a chance to run.
    pub(crate) fn accept(
        self: &Arc<Self>,
        socket: Socket,
        processor: Box<dyn ConnectionProcessor>,
    ) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(limit) = self.options.connection_limit {
            if self.count() >= limit {
                let remote = socket.remote_address();
                debug!("connection limit ({}) reached, rejecting {}", limit, remote);
                let (status, body) =
                    (self.options.connection_limit_response_generator)(limit, &remote);
                let raw = response::render_simple(status, &body);
                let _ = socket.try_write(&raw);
                return;
            }
        }
        let handler = SocketHandler::new(socket, processor, Arc::downgrade(self));
        let key = handler.key();
        self.connections
            .write()
            .unwrap()
            .insert(key, handler.clone());
        trace!("accepted connection {} ({} live)", key, self.count());
        tokio::spawn(handler.run());
        self.sweep_idle(false);
    }

    pub(crate) fn handler(&self, key: i32) -> Option<Arc<SocketHandler>> {
        self.connections.read().unwrap().get(&key).cloned()
    }

    pub(crate) fn remove(&self, key: i32) {
        self.connections.write().unwrap().remove(&key);
    }

    /// The number of live connections.
    pub fn count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Walks the connection map and prepares every idle connection past
    /// its keep-alive deadline to close. Unless `force` is set, the walk
    /// is skipped when one already ran within the check interval.
    pub(crate) fn sweep_idle(&self, force: bool) {
        let now = Instant::now();
        {
            let mut last = self.last_sweep.lock().unwrap();
            if !force && now.duration_since(*last) < IDLE_CHECK_INTERVAL {
                return;
            }
            *last = now;
        }
        let handlers: Vec<Arc<SocketHandler>> = {
            let map = self.connections.read().unwrap();
            map.values().cloned().collect()
        };
        for handler in handlers {
            if handler.idle_past(now) {
                debug!(
                    "evicting idle connection {} ({})",
                    handler.key(),
                    handler.remote_address()
                );
                handler.prepare_to_close();
            }
        }
    }

    /// Spawns the periodic idle sweep for this manager. The task lives
    /// until the manager stops.
    pub(crate) fn start_sweeper(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(IDLE_CHECK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match manager.upgrade() {
                    Some(manager) => {
                        if manager.is_stopped() {
                            break;
                        }
                        manager.sweep_idle(true);
                    }
                    None => break,
                }
            }
        });
    }

    /// Force-closes every connection, regardless of in-progress state.
    /// New accepts are refused from here on.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers: Vec<Arc<SocketHandler>> = {
            let map = self.connections.read().unwrap();
            map.values().cloned().collect()
        };
        debug!("stopping, closing {} connections", handlers.len());
        for handler in handlers {
            handler.close();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
