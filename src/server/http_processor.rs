use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, error, trace};

use crate::buffer::BufferList;
use crate::parse::{HttpParser, ParseErrorState, ParseMode, ParserState, ParserStatus};
use crate::status::StatusCode;

use super::handler::SocketHandler;
use super::processor::ConnectionProcessor;
use super::request::{self, ServerRequest};
use super::response::{render_simple, KeepAlivePlan, ResponseChannel, ServerResponse};
use super::upgrade;
use super::{ServerDelegate, ServerOptions};

/// Drives the HTTP/1.x protocol on one connection.
///
/// State machine: `Initial` parses a request; on message-complete the
/// delegate is dispatched and the processor sits in `HeadersParsed`
/// until the response ends; a keep-alive response moves it to `Reset`,
/// ready to parse the successor; anything else is `Done`.
pub(crate) struct HttpProcessor {
    parser: HttpParser,
    status: ParserStatus,
    delegate: Arc<dyn ServerDelegate>,
    options: Arc<ServerOptions>,
    handler: Weak<SocketHandler>,
    state: State,
    active: bool,
    in_progress: bool,
    keep_alive_until: Option<Instant>,
    requests_remaining: u32,
    bytes_accumulated: usize,
    remote: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Initial,
    Reset,
    HeadersParsed,
    Done,
}

impl HttpProcessor {
    pub(crate) fn new(
        delegate: Arc<dyn ServerDelegate>,
        options: Arc<ServerOptions>,
    ) -> HttpProcessor {
        let requests_remaining = options.keep_alive_max_requests;
        let keep_alive_until = Some(Instant::now() + options.keep_alive_timeout);
        HttpProcessor {
            parser: HttpParser::new(ParseMode::Request, false),
            status: ParserStatus::new(),
            delegate,
            options,
            handler: Weak::new(),
            state: State::Initial,
            active: true,
            in_progress: false,
            keep_alive_until,
            requests_remaining,
            bytes_accumulated: 0,
            remote: String::new(),
        }
    }

    fn parse_incoming(&mut self, buffer: &mut BufferList) -> bool {
        let data = buffer.remaining_slice().to_vec();
        let (consumed, _) = self.parser.execute(&data);
        buffer.advance(consumed);
        self.bytes_accumulated += consumed;

        if self.parser.is_failed() {
            self.status.error = ParseErrorState::ParsedLessThanRead;
            debug!(
                "malformed request from {} ({:?})",
                self.remote, self.status.error
            );
            self.respond_and_close(StatusCode::BadRequest, "");
            buffer.advance(buffer.remaining());
            return true;
        }

        if let Some(limit) = self.options.request_size_limit {
            if self.bytes_accumulated > limit {
                error!(
                    "request from {} exceeded the size limit of {} bytes",
                    self.remote, limit
                );
                let (status, body) =
                    (self.options.request_size_response_generator)(limit, &self.remote);
                self.respond_and_close(status, &body);
                buffer.advance(buffer.remaining());
                return true;
            }
        }

        if !self.parser.is_complete() {
            self.status.state = if self.parser.is_headers_complete() {
                ParserState::HeadersComplete
            } else {
                ParserState::Initial
            };
            trace!("request incomplete, parser in {:?}", self.status.state);
            return true;
        }

        // message complete: the rest of the buffer belongs to the next
        // message (or the upgraded protocol) and stays with the handler
        self.status.state = ParserState::MessageComplete;
        self.status.keep_alive = self.parser.is_keep_alive();
        self.status.upgrade = self.parser.is_upgrade();
        self.status.bytes_left = buffer.remaining();
        trace!(
            "message complete (keep_alive={}, upgrade={}, {} bytes left over)",
            self.status.keep_alive,
            self.status.upgrade,
            self.status.bytes_left
        );
        // tail bytes were never consumed into this request
        self.in_progress = true;
        self.state = State::HeadersParsed;

        if self.status.upgrade {
            self.handle_upgrade();
        } else {
            self.dispatch();
        }
        buffer.remaining() == 0
    }

    /// Assembles the request/response pair and runs the delegate on a
    /// worker, leaving the I/O thread free.
    fn dispatch(&mut self) {
        trace!("dispatching {} {}",
            self.parser.method().map(|m| m.as_str()).unwrap_or("-"),
            self.parser.url_string());
        let (request, response) = self.assemble();
        let delegate = self.delegate.clone();
        tokio::task::spawn_blocking(move || {
            let mut request = request;
            let mut response = response;
            delegate.handle(&mut request, &mut response);
            if !response.ended() {
                if let Err(e) = response.end() {
                    debug!("implicit response end failed: {}", e);
                }
            }
        });
    }

    fn handle_upgrade(&mut self) {
        let handler = match self.handler.upgrade() {
            Some(handler) => handler,
            None => return,
        };
        let (request, response) = self.assemble();
        upgrade::upgrade_connection(&handler, request, response);
        // whether or not a new processor took over, this one is finished
        self.state = State::Done;
        self.active = false;
        self.in_progress = false;
    }

    fn assemble(&mut self) -> (ServerRequest, ServerResponse) {
        let method = self.parser.method().cloned().unwrap_or_default();
        let target = self.parser.url_string().to_owned();
        let headers = self.parser.take_headers();
        let url = request::reconstruct_url(&target, &headers);
        let mut body = BufferList::new();
        self.parser.body_mut().fill_buffer(&mut body);
        let request = ServerRequest::new(
            method,
            target,
            url,
            self.parser.http_version(),
            headers,
            self.remote.clone(),
            body,
        );
        let plan = KeepAlivePlan {
            requested: self.status.keep_alive,
            requests_remaining: self.requests_remaining,
            timeout: self.options.keep_alive_timeout,
        };
        let response = ServerResponse::new(
            ResponseChannel::Http {
                handler: self.handler.clone(),
            },
            plan,
        );
        (request, response)
    }

    fn respond_and_close(&mut self, status: StatusCode, body: &str) {
        if let Some(handler) = self.handler.upgrade() {
            handler.write(&render_simple(status, body));
            handler.prepare_to_close();
        }
        self.state = State::Done;
        self.in_progress = false;
    }
}

impl ConnectionProcessor for HttpProcessor {
    fn process(&mut self, buffer: &mut BufferList) -> bool {
        if !self.active {
            buffer.advance(buffer.remaining());
            return true;
        }
        match self.state {
            State::Done => {
                // request already rejected or connection on its way out
                buffer.advance(buffer.remaining());
                true
            }
            State::HeadersParsed => {
                // a request is in flight; hold the bytes until its
                // response ends
                false
            }
            State::Reset => {
                self.parser.reset();
                self.status.reset();
                self.status.state = ParserState::Reset;
                self.bytes_accumulated = 0;
                self.state = State::Initial;
                self.parse_incoming(buffer)
            }
            State::Initial => self.parse_incoming(buffer),
        }
    }

    fn socket_closed(&mut self) {
        if !self.active {
            return;
        }
        if !self.parser.on_socket_eof() {
            // mid-message EOF: close silently, never invoke the delegate
            self.status.error = ParseErrorState::UnexpectedEof;
            debug!("client {} disconnected mid-message", self.remote);
        }
        self.state = State::Done;
        self.in_progress = false;
    }

    fn response_ended(&mut self, keep_alive: bool) {
        if !self.active {
            return;
        }
        self.in_progress = false;
        if keep_alive {
            self.requests_remaining = self.requests_remaining.saturating_sub(1);
            self.keep_alive_until =
                Some(Instant::now() + self.options.keep_alive_timeout);
            self.state = State::Reset;
            trace!(
                "connection {} reset for reuse, {} requests remaining",
                self.remote,
                self.requests_remaining
            );
        } else {
            self.state = State::Done;
        }
    }

    fn in_progress(&self) -> bool {
        self.in_progress
    }

    fn keep_alive_until(&self) -> Option<Instant> {
        self.keep_alive_until
    }

    fn mark_inactive(&mut self) {
        self.active = false;
        self.in_progress = false;
        self.keep_alive_until = None;
    }

    fn set_handler(&mut self, handler: Weak<SocketHandler>) {
        if let Some(h) = handler.upgrade() {
            self.remote = h.remote_address().to_owned();
        }
        self.handler = handler;
    }
}

impl std::fmt::Debug for HttpProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProcessor")
            .field("state", &self.state)
            .field("active", &self.active)
            .field("requests_remaining", &self.requests_remaining)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(options: ServerOptions) -> HttpProcessor {
        let delegate =
            Arc::new(|_req: &mut ServerRequest, _res: &mut ServerResponse| {});
        HttpProcessor::new(delegate, Arc::new(options))
    }

    fn buffer(data: &[u8]) -> BufferList {
        BufferList::from(data)
    }

    #[tokio::test]
    async fn complete_request_moves_to_headers_parsed() {
        let mut p = processor(ServerOptions::new());
        let mut buf = buffer(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n");
        assert!(p.process(&mut buf));
        assert_eq!(p.state, State::HeadersParsed);
        assert!(p.in_progress());
    }

    #[tokio::test]
    async fn pipelined_tail_is_refused_until_reset() {
        let mut p = processor(ServerOptions::new());
        let mut buf = buffer(
            b"GET /one HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
              GET /two HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        );
        // the tail stays unconsumed while request one is in flight
        assert!(!p.process(&mut buf));
        assert!(buf.remaining() > 0);
        assert!(!p.process(&mut buf));

        p.response_ended(true);
        assert_eq!(p.state, State::Reset);
        assert!(p.process(&mut buf));
        assert_eq!(buf.remaining(), 0);
        assert_eq!(p.state, State::HeadersParsed);
    }

    #[tokio::test]
    async fn response_ended_counts_down() {
        let mut options = ServerOptions::new();
        options.keep_alive_max_requests = 3;
        let mut p = processor(options);
        assert_eq!(p.requests_remaining, 3);
        p.response_ended(true);
        assert_eq!(p.requests_remaining, 2);
        assert!(p.keep_alive_until().is_some());
        p.response_ended(false);
        assert_eq!(p.state, State::Done);
    }

    #[tokio::test]
    async fn partial_head_stays_initial() {
        let mut p = processor(ServerOptions::new());
        let mut buf = buffer(b"GET / HT");
        assert!(p.process(&mut buf));
        assert_eq!(p.state, State::Initial);
        assert!(!p.in_progress());

        let mut rest = buffer(b"TP/1.1\r\nHost: h\r\n\r\n");
        assert!(p.process(&mut rest));
        assert_eq!(p.state, State::HeadersParsed);
    }

    #[tokio::test]
    async fn size_limit_parks_the_processor() {
        let mut options = ServerOptions::new();
        options.request_size_limit = Some(64);
        let mut p = processor(options);
        let mut buf = buffer(
            b"POST / HTTP/1.1\r\nHost: h\r\nContent-Length: 100\r\n\r\n",
        );
        assert!(p.process(&mut buf));
        let mut body = buffer(&[b'z'; 100]);
        assert!(p.process(&mut body));
        assert_eq!(p.state, State::Done);
        assert!(!p.in_progress());

        // anything further is swallowed without parsing
        let mut late = buffer(b"GET / HTTP/1.1\r\n\r\n");
        assert!(p.process(&mut late));
        assert_eq!(late.remaining(), 0);
        assert_eq!(p.state, State::Done);
    }

    #[tokio::test]
    async fn mark_inactive_clears_deadline() {
        let mut p = processor(ServerOptions::new());
        assert!(p.keep_alive_until().is_some());
        p.mark_inactive();
        assert!(p.keep_alive_until().is_none());
        assert!(!p.in_progress());
    }

    #[tokio::test]
    async fn eof_mid_message_is_silent() {
        let mut p = processor(ServerOptions::new());
        let mut buf = buffer(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");
        assert!(p.process(&mut buf));
        p.socket_closed();
        assert_eq!(p.state, State::Done);
        assert_eq!(p.status.error, ParseErrorState::UnexpectedEof);
    }
}
