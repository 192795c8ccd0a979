//! HTTP and FastCGI servers.
//!
//! Both servers share one engine: a listener accepts sockets and hands
//! them to the [`ConnectionManager`], which wraps each in a
//! [`SocketHandler`] driving a per-protocol [`ConnectionProcessor`].
//! Parsed requests reach the [`ServerDelegate`] on a worker pool, never
//! on an I/O task.

pub mod upgrade;

pub(crate) mod handler;
pub(crate) mod http_processor;
pub(crate) mod listener;
pub(crate) mod manager;
pub(crate) mod processor;
pub(crate) mod request;
pub(crate) mod response;
pub(crate) mod socket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

pub use self::handler::SocketHandler;
pub use self::manager::ConnectionManager;
pub use self::processor::ConnectionProcessor;
pub use self::request::ServerRequest;
pub use self::response::ServerResponse;
pub use self::upgrade::ConnectionUpgradeFactory;

use self::http_processor::HttpProcessor;
use crate::fastcgi::processor::FastCgiProcessor;
use crate::status::StatusCode;

/// Handles fully parsed requests.
///
/// Runs on a blocking-friendly worker; reading the request body and
/// writing the response never touch an I/O task. If `handle` returns
/// without ending the response, the engine ends it.
pub trait ServerDelegate: Send + Sync + 'static {
    /// Serves one request.
    fn handle(&self, request: &mut ServerRequest, response: &mut ServerResponse);
}

impl<F> ServerDelegate for F
where
    F: Fn(&mut ServerRequest, &mut ServerResponse) + Send + Sync + 'static,
{
    fn handle(&self, request: &mut ServerRequest, response: &mut ServerResponse) {
        self(request, response)
    }
}

type ResponseGenerator = Box<dyn Fn(usize, &str) -> (StatusCode, String) + Send + Sync>;

/// Policy knobs supplied when a server is constructed.
pub struct ServerOptions {
    /// Most connections allowed at once; `None` is unlimited.
    pub connection_limit: Option<usize>,
    /// Most bytes one request (head plus body) may occupy; `None` is
    /// unlimited.
    pub request_size_limit: Option<usize>,
    /// Idle allowance stamped after each keep-alive response.
    pub keep_alive_timeout: Duration,
    /// Requests allowed per connection before it is closed.
    pub keep_alive_max_requests: u32,
    pub(crate) connection_limit_response_generator: ResponseGenerator,
    pub(crate) request_size_response_generator: ResponseGenerator,
}

impl ServerOptions {
    /// Defaults: no limits, 60 s keep-alive allowance, 100 requests per
    /// connection, `503`/`413` rejection responses with empty bodies.
    pub fn new() -> ServerOptions {
        ServerOptions {
            connection_limit: None,
            request_size_limit: None,
            keep_alive_timeout: Duration::from_secs(60),
            keep_alive_max_requests: 100,
            connection_limit_response_generator: Box::new(|limit, client| {
                debug!("rejecting {}: connection limit of {} reached", client, limit);
                (StatusCode::ServiceUnavailable, String::new())
            }),
            request_size_response_generator: Box::new(|limit, client| {
                debug!("rejecting {}: request exceeded {} bytes", client, limit);
                (StatusCode::RequestEntityTooLarge, String::new())
            }),
        }
    }

    /// Replaces the response sent when the connection limit rejects a
    /// client. The closure receives the limit and the client address.
    pub fn set_connection_limit_response_generator(
        &mut self,
        generator: impl Fn(usize, &str) -> (StatusCode, String) + Send + Sync + 'static,
    ) {
        self.connection_limit_response_generator = Box::new(generator);
    }

    /// Replaces the response sent when a request exceeds the size
    /// limit. The closure receives the limit and the client address.
    pub fn set_request_size_response_generator(
        &mut self,
        generator: impl Fn(usize, &str) -> (StatusCode, String) + Send + Sync + 'static,
    ) {
        self.request_size_response_generator = Box::new(generator);
    }
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions::new()
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("connection_limit", &self.connection_limit)
            .field("request_size_limit", &self.request_size_limit)
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("keep_alive_max_requests", &self.keep_alive_max_requests)
            .finish()
    }
}

/// The machinery shared by [`HttpServer`] and [`FastCgiServer`]; the
/// variants differ only in the processor they construct per accepted
/// socket.
struct ServerCore {
    delegate: Arc<dyn ServerDelegate>,
    options: Arc<ServerOptions>,
    manager: Option<Arc<ConnectionManager>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    started: Vec<Box<dyn Fn() + Send + Sync>>,
    stopped: Vec<Box<dyn Fn() + Send + Sync>>,
    failed: Vec<Box<dyn Fn(&crate::Error) + Send + Sync>>,
}

impl ServerCore {
    fn new(delegate: Arc<dyn ServerDelegate>) -> ServerCore {
        ServerCore {
            delegate,
            options: Arc::new(ServerOptions::new()),
            manager: None,
            accept_task: None,
            local_addr: None,
            started: Vec::new(),
            stopped: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn set_options(&mut self, options: ServerOptions) {
        self.options = Arc::new(options);
    }

    fn start(
        &mut self,
        listener: listener::Listener,
        local_addr: Option<SocketAddr>,
        make_processor: Arc<dyn Fn() -> Box<dyn ConnectionProcessor> + Send + Sync>,
    ) {
        let manager = ConnectionManager::new(self.options.clone());
        manager.start_sweeper();
        self.accept_task = Some(tokio::spawn(listener::accept_loop(
            listener,
            manager.clone(),
            make_processor,
        )));
        self.manager = Some(manager);
        self.local_addr = local_addr;
        for callback in &self.started {
            callback();
        }
    }

    fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(manager) = self.manager.take() {
            manager.stop();
        }
        for callback in &self.stopped {
            callback();
        }
    }

    fn connection_count(&self) -> usize {
        self.manager.as_ref().map(|m| m.count()).unwrap_or(0)
    }

    fn report_failure(&self, error: &crate::Error) {
        for callback in &self.failed {
            callback(error);
        }
    }
}

/// An HTTP/1.x server.
///
/// ```no_run
/// use std::sync::Arc;
/// use shoal::server::{HttpServer, ServerRequest, ServerResponse};
///
/// # async fn run() -> shoal::Result<()> {
/// let mut server = HttpServer::new(Arc::new(
///     |_req: &mut ServerRequest, res: &mut ServerResponse| {
///         res.set_header("Content-Type", "text/plain");
///         res.write_str("hello").unwrap();
///     },
/// ));
/// server.listen(8080).await?;
/// # Ok(())
/// # }
/// ```
pub struct HttpServer {
    core: ServerCore,
}

impl HttpServer {
    /// Creates a server that will hand every request to `delegate`.
    pub fn new(delegate: Arc<dyn ServerDelegate>) -> HttpServer {
        HttpServer {
            core: ServerCore::new(delegate),
        }
    }

    /// Installs policy options. Only affects listeners started after
    /// the call.
    pub fn set_options(&mut self, options: ServerOptions) {
        self.core.set_options(options);
    }

    /// Runs after the server has bound and begun accepting.
    pub fn on_started(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.core.started.push(Box::new(callback));
    }

    /// Runs after [`stop`](HttpServer::stop).
    pub fn on_stopped(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.core.stopped.push(Box::new(callback));
    }

    /// Runs when a listener fails to come up.
    pub fn on_failed(&mut self, callback: impl Fn(&crate::Error) + Send + Sync + 'static) {
        self.core.failed.push(Box::new(callback));
    }

    /// Binds `port` (0 for an ephemeral port) and starts accepting.
    /// Returns once the listener is live; serving continues in the
    /// background until [`stop`](HttpServer::stop).
    pub async fn listen(&mut self, port: u16) -> crate::Result<()> {
        let (tcp, local) = match listener::bind_tcp(port) {
            Ok(bound) => bound,
            Err(e) => {
                self.core.report_failure(&e);
                return Err(e);
            }
        };
        self.start(listener::Listener::Tcp(tcp), Some(local));
        Ok(())
    }

    /// Binds a Unix-domain socket path and starts accepting.
    #[cfg(unix)]
    pub async fn listen_unix(&mut self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let unix = match listener::bind_unix(path.as_ref()) {
            Ok(bound) => bound,
            Err(e) => {
                self.core.report_failure(&e);
                return Err(e);
            }
        };
        self.start(listener::Listener::Unix(unix), None);
        Ok(())
    }

    fn start(&mut self, listener: listener::Listener, local: Option<SocketAddr>) {
        let delegate = self.core.delegate.clone();
        let options = self.core.options.clone();
        let make = Arc::new(move || {
            Box::new(HttpProcessor::new(delegate.clone(), options.clone()))
                as Box<dyn ConnectionProcessor>
        });
        self.core.start(listener, local, make);
    }

    /// The bound address, once listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr
    }

    /// Live connections right now.
    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }

    /// Stops accepting and force-closes every connection.
    pub fn stop(&mut self) {
        self.core.stop();
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &self.core.local_addr)
            .finish()
    }
}

/// A FastCGI responder server, for running behind a front-end web
/// server that speaks FastCGI to its upstreams.
pub struct FastCgiServer {
    core: ServerCore,
}

impl FastCgiServer {
    /// Creates a server that will hand every assembled request to
    /// `delegate`.
    pub fn new(delegate: Arc<dyn ServerDelegate>) -> FastCgiServer {
        FastCgiServer {
            core: ServerCore::new(delegate),
        }
    }

    /// Installs policy options. Only affects listeners started after
    /// the call.
    pub fn set_options(&mut self, options: ServerOptions) {
        self.core.set_options(options);
    }

    /// Runs after the server has bound and begun accepting.
    pub fn on_started(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.core.started.push(Box::new(callback));
    }

    /// Runs after [`stop`](FastCgiServer::stop).
    pub fn on_stopped(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.core.stopped.push(Box::new(callback));
    }

    /// Runs when a listener fails to come up.
    pub fn on_failed(&mut self, callback: impl Fn(&crate::Error) + Send + Sync + 'static) {
        self.core.failed.push(Box::new(callback));
    }

    /// Binds `port` (0 for an ephemeral port) and starts accepting.
    pub async fn listen(&mut self, port: u16) -> crate::Result<()> {
        let (tcp, local) = match listener::bind_tcp(port) {
            Ok(bound) => bound,
            Err(e) => {
                self.core.report_failure(&e);
                return Err(e);
            }
        };
        self.start(listener::Listener::Tcp(tcp), Some(local));
        Ok(())
    }

    /// Binds a Unix-domain socket path and starts accepting.
    #[cfg(unix)]
    pub async fn listen_unix(&mut self, path: impl AsRef<std::path::Path>) -> crate::Result<()> {
        let unix = match listener::bind_unix(path.as_ref()) {
            Ok(bound) => bound,
            Err(e) => {
                self.core.report_failure(&e);
                return Err(e);
            }
        };
        self.start(listener::Listener::Unix(unix), None);
        Ok(())
    }

    fn start(&mut self, listener: listener::Listener, local: Option<SocketAddr>) {
        let delegate = self.core.delegate.clone();
        let options = self.core.options.clone();
        let make = Arc::new(move || {
            Box::new(FastCgiProcessor::new(delegate.clone(), options.clone()))
                as Box<dyn ConnectionProcessor>
        });
        self.core.start(listener, local, make);
    }

    /// The bound address, once listening on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr
    }

    /// Live connections right now.
    pub fn connection_count(&self) -> usize {
        self.core.connection_count()
    }

    /// Stops accepting and force-closes every connection.
    pub fn stop(&mut self) {
        self.core.stop();
    }
}

impl std::fmt::Debug for FastCgiServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastCgiServer")
            .field("local_addr", &self.core.local_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults() {
        let options = ServerOptions::new();
        assert_eq!(options.connection_limit, None);
        assert_eq!(options.request_size_limit, None);
        assert_eq!(options.keep_alive_timeout, Duration::from_secs(60));
        assert_eq!(options.keep_alive_max_requests, 100);

        let (status, body) = (options.connection_limit_response_generator)(5, "peer");
        assert_eq!(status, StatusCode::ServiceUnavailable);
        assert!(body.is_empty());

        let (status, body) = (options.request_size_response_generator)(5, "peer");
        assert_eq!(status, StatusCode::RequestEntityTooLarge);
        assert!(body.is_empty());
    }

    #[test]
    fn generators_are_replaceable() {
        let mut options = ServerOptions::new();
        options.set_connection_limit_response_generator(|limit, client| {
            (
                StatusCode::TooManyRequests,
                format!("{} is one over {}", client, limit),
            )
        });
        let (status, body) = (options.connection_limit_response_generator)(9, "x");
        assert_eq!(status, StatusCode::TooManyRequests);
        assert_eq!(body, "x is one over 9");
    }
}
