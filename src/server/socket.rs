use std::io;

use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// A connected, non-blocking stream socket.
///
/// Both variants expose the same readiness-style surface: `ready` waits
/// for the reactor, `try_read`/`try_write` never block and report
/// `WouldBlock` when the socket is not actually ready.
#[derive(Debug)]
pub(crate) enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    pub(crate) async fn ready(&self, interest: Interest) -> io::Result<Ready> {
        match self {
            Socket::Tcp(s) => s.ready(interest).await,
            #[cfg(unix)]
            Socket::Unix(s) => s.ready(interest).await,
        }
    }

    pub(crate) fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.try_read(buf),
        }
    }

    pub(crate) fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.try_write(buf),
            #[cfg(unix)]
            Socket::Unix(s) => s.try_write(buf),
        }
    }

    /// A stable per-connection key for the connection map.
    #[cfg(unix)]
    pub(crate) fn key(&self) -> i32 {
        use std::os::unix::io::AsRawFd;
        match self {
            Socket::Tcp(s) => s.as_raw_fd(),
            Socket::Unix(s) => s.as_raw_fd(),
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn key(&self) -> i32 {
        use std::os::windows::io::AsRawSocket;
        match self {
            Socket::Tcp(s) => s.as_raw_socket() as i32,
        }
    }

    /// The remote endpoint, rendered for logs.
    pub(crate) fn remote_address(&self) -> String {
        match self {
            Socket::Tcp(s) => s
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".to_owned()),
            #[cfg(unix)]
            Socket::Unix(_) => "unix".to_owned(),
        }
    }
}
