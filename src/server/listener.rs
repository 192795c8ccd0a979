use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, error, trace};

use super::manager::ConnectionManager;
use super::processor::ConnectionProcessor;
use super::socket::Socket;

/// Listen backlog: Linux gets the nginx-style 511, elsewhere a
/// conservative default stands in for the system's.
#[cfg(target_os = "linux")]
const BACKLOG: i32 = 511;
#[cfg(not(target_os = "linux"))]
const BACKLOG: i32 = 128;

/// How long to pause after an accept error that is not tied to a single
/// connection, so a transient fault (fd exhaustion, mostly) does not
/// spin the accept loop.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_secs(1);

pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Binds a TCP listening socket on every interface. Port 0 asks the
/// system for an ephemeral port; the caller reads it back with
/// `local_addr`.
pub(crate) fn bind_tcp(port: u16) -> crate::Result<(TcpListener, SocketAddr)> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = RawSocket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(crate::Error::new_listen)?;
    socket
        .set_reuse_address(true)
        .map_err(crate::Error::new_listen)?;
    socket
        .bind(&addr.into())
        .map_err(crate::Error::new_listen)?;
    socket.listen(BACKLOG).map_err(crate::Error::new_listen)?;
    let std_listener: StdTcpListener = socket.into();
    std_listener
        .set_nonblocking(true)
        .map_err(crate::Error::new_listen)?;
    let local = std_listener
        .local_addr()
        .map_err(crate::Error::new_listen)?;
    let listener = TcpListener::from_std(std_listener).map_err(crate::Error::new_listen)?;
    debug!("listening on {}", local);
    Ok((listener, local))
}

/// Binds a Unix-domain listening socket, replacing a stale socket file
/// from an earlier run.
#[cfg(unix)]
pub(crate) fn bind_unix(path: &std::path::Path) -> crate::Result<UnixListener> {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    let listener = UnixListener::bind(path).map_err(crate::Error::new_listen)?;
    debug!("listening on unix socket {}", path.display());
    Ok(listener)
}

/// Accepts clients until the manager stops, handing each accepted
/// socket to the connection manager with a fresh processor.
pub(crate) async fn accept_loop(
    listener: Listener,
    manager: Arc<ConnectionManager>,
    make_processor: Arc<dyn Fn() -> Box<dyn ConnectionProcessor> + Send + Sync>,
) {
    loop {
        let accepted = match listener {
            Listener::Tcp(ref l) => l.accept().await.map(|(s, _)| Socket::Tcp(s)),
            #[cfg(unix)]
            Listener::Unix(ref l) => l.accept().await.map(|(s, _)| Socket::Unix(s)),
        };
        match accepted {
            Ok(socket) => {
                trace!("accepted {}", socket.remote_address());
                manager.accept(socket, make_processor());
            }
            Err(e) => {
                if manager.is_stopped() {
                    break;
                }
                if is_connection_error(&e) {
                    // the would-be client is already gone; move on
                    continue;
                }
                error!("accept error: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
            }
        }
        if manager.is_stopped() {
            break;
        }
    }
    debug!("listener exiting");
}

/// Errors that concern only the connection being accepted, not the
/// listener itself.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
