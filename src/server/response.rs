use std::sync::Weak;
use std::time::Duration;

use crate::buffer::BufferList;
use crate::common::date;
use crate::error::User;
use crate::headers::HeadersContainer;
use crate::status::StatusCode;

use super::handler::SocketHandler;

const AVERAGE_HEADER_SIZE: usize = 30;

/// The response half handed to the
/// [`ServerDelegate`](super::ServerDelegate).
///
/// Nothing touches the wire until [`end`](ServerResponse::end): status
/// line, headers, and buffered body are flushed in one write, with the
/// connection header chosen by the keep-alive plan. If the delegate
/// returns without ending, the engine ends the response for it.
pub struct ServerResponse {
    status: StatusCode,
    headers: HeadersContainer,
    body: BufferList,
    channel: ResponseChannel,
    keep_alive: KeepAlivePlan,
    upgrading: bool,
    ended: bool,
    start_flushed: bool,
}

/// Where the rendered response bytes go.
pub(crate) enum ResponseChannel {
    /// Straight onto the socket as HTTP/1.1.
    Http { handler: Weak<SocketHandler> },
    /// Wrapped in FastCGI STDOUT records, then END_REQUEST, then close.
    Fcgi {
        handler: Weak<SocketHandler>,
        request_id: u16,
        extra_request_ids: Vec<u16>,
    },
}

/// The keep-alive arithmetic captured when the request was dispatched.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeepAlivePlan {
    /// Whether the client asked (or defaulted) to keep the connection.
    pub(crate) requested: bool,
    /// Requests still allowed on this connection, counting the current
    /// one.
    pub(crate) requests_remaining: u32,
    /// The idle allowance advertised in the `Keep-Alive` header.
    pub(crate) timeout: Duration,
}

impl KeepAlivePlan {
    pub(crate) fn none() -> KeepAlivePlan {
        KeepAlivePlan {
            requested: false,
            requests_remaining: 0,
            timeout: Duration::from_secs(0),
        }
    }
}

impl ServerResponse {
    pub(crate) fn new(channel: ResponseChannel, keep_alive: KeepAlivePlan) -> ServerResponse {
        let mut headers = HeadersContainer::new();
        headers.set_value("Date", date::now());
        ServerResponse {
            status: StatusCode::Ok,
            headers,
            body: BufferList::new(),
            channel,
            keep_alive,
            upgrading: false,
            ended: false,
            start_flushed: false,
        }
    }

    /// The status that will be sent; defaults to `200 OK`.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Changes the status to send.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// The response headers.
    pub fn headers(&self) -> &HeadersContainer {
        &self.headers
    }

    /// The response headers, for modification.
    pub fn headers_mut(&mut self) -> &mut HeadersContainer {
        &mut self.headers
    }

    /// Sets a single-valued header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.set_value(name, value);
    }

    /// Whether `end` has run.
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Whether the status line and headers have reached the write path.
    pub fn start_flushed(&self) -> bool {
        self.start_flushed
    }

    pub(crate) fn set_upgrading(&mut self) {
        self.upgrading = true;
    }

    /// Buffers body bytes. They reach the wire when the response ends.
    pub fn write(&mut self, data: &[u8]) -> crate::Result<()> {
        if self.ended {
            return Err(crate::Error::new_user(User::ResponseEnded));
        }
        self.body.append(data);
        Ok(())
    }

    /// Buffers a body string.
    pub fn write_str(&mut self, data: &str) -> crate::Result<()> {
        self.write(data.as_bytes())
    }

    /// Renders and flushes the response, then settles the connection:
    /// reset for the next keep-alive request, left open for an upgrade,
    /// or prepared to close.
    pub fn end(&mut self) -> crate::Result<()> {
        if self.ended {
            return Err(crate::Error::new_user(User::ResponseEnded));
        }
        let keeping = self.upgrading
            || (self.keep_alive.requested
                && self.keep_alive.requests_remaining > 1
                && matches!(self.channel, ResponseChannel::Http { .. }));
        let keep_alive = keeping && !self.upgrading;

        if !self.upgrading {
            if keep_alive {
                self.headers.set_value("Connection", "Keep-Alive");
                self.headers.set_value(
                    "Keep-Alive",
                    format!(
                        "timeout={}, max={}",
                        self.keep_alive.timeout.as_secs(),
                        self.keep_alive.requests_remaining - 1
                    ),
                );
            } else if matches!(self.channel, ResponseChannel::Http { .. }) {
                self.headers.set_value("Connection", "Close");
            }
        }

        let raw = self.render();
        self.ended = true;
        self.start_flushed = true;

        match self.channel {
            ResponseChannel::Http { ref handler } => {
                if let Some(handler) = handler.upgrade() {
                    handler.write(&raw);
                    if self.upgrading {
                        // the socket stays open for the new protocol;
                        // the swapped-out processor settles itself
                    } else if keep_alive {
                        handler.response_ended(true);
                        handler.nudge_read();
                    } else {
                        handler.response_ended(false);
                        handler.prepare_to_close();
                    }
                }
            }
            ResponseChannel::Fcgi {
                ref handler,
                request_id,
                ref extra_request_ids,
            } => {
                if let Some(handler) = handler.upgrade() {
                    crate::fastcgi::response::write_http_payload(
                        &handler,
                        request_id,
                        &raw,
                        extra_request_ids,
                    )?;
                    handler.response_ended(false);
                    handler.prepare_to_close();
                }
            }
        }
        Ok(())
    }

    /// Status line, headers in insertion order (one line per value), a
    /// blank line, then the buffered body.
    fn render(&mut self) -> Vec<u8> {
        let mut dst = Vec::with_capacity(
            30 + self.headers.len() * AVERAGE_HEADER_SIZE + self.body.remaining(),
        );
        dst.extend_from_slice(b"HTTP/1.1 ");
        let mut code = itoa::Buffer::new();
        dst.extend_from_slice(code.format(self.status.as_i32()).as_bytes());
        dst.push(b' ');
        dst.extend_from_slice(self.status.canonical_reason().as_bytes());
        dst.extend_from_slice(b"\r\n");
        for (name, values) in self.headers.iter() {
            for value in values {
                dst.extend_from_slice(name.as_bytes());
                dst.extend_from_slice(b": ");
                dst.extend_from_slice(value.as_bytes());
                dst.extend_from_slice(b"\r\n");
            }
        }
        dst.extend_from_slice(b"\r\n");
        self.body.fill_vec(&mut dst);
        dst
    }

    /// Returns the response to its just-constructed state so it can
    /// serve the next request on a reused connection: body, headers and
    /// status cleared, `Date` re-stamped.
    pub fn reset(&mut self) {
        self.body.reset();
        self.headers.clear();
        self.headers.set_value("Date", date::now());
        self.status = StatusCode::Ok;
        self.ended = false;
        self.start_flushed = false;
        self.upgrading = false;
    }
}

impl std::fmt::Debug for ServerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerResponse")
            .field("status", &self.status)
            .field("ended", &self.ended)
            .field("upgrading", &self.upgrading)
            .finish()
    }
}

/// Renders a free-standing response used for accept-time rejections
/// (connection limit, oversize requests) where no delegate ever runs.
pub(crate) fn render_simple(status: StatusCode, body: &str) -> Vec<u8> {
    let mut dst = Vec::with_capacity(128 + body.len());
    dst.extend_from_slice(b"HTTP/1.1 ");
    let mut code = itoa::Buffer::new();
    dst.extend_from_slice(code.format(status.as_i32()).as_bytes());
    dst.push(b' ');
    dst.extend_from_slice(status.canonical_reason().as_bytes());
    dst.extend_from_slice(b"\r\nDate: ");
    date::extend(&mut dst);
    dst.extend_from_slice(b"\r\nConnection: Close\r\nContent-Length: ");
    dst.extend_from_slice(code.format(body.len()).as_bytes());
    dst.extend_from_slice(b"\r\n\r\n");
    dst.extend_from_slice(body.as_bytes());
    dst
}
