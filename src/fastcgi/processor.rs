use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, trace};

use crate::buffer::BufferList;
use crate::fastcgi::record::{self, ParseError, ProtocolStatus, Record};
use crate::headers::HeadersContainer;
use crate::method::Method;
use crate::server::handler::SocketHandler;
use crate::server::processor::ConnectionProcessor;
use crate::server::request::ServerRequest;
use crate::server::response::{KeepAlivePlan, ResponseChannel, ServerResponse};
use crate::server::{ServerDelegate, ServerOptions};

/// Drives the FastCGI responder protocol on one connection.
///
/// The first BEGIN_REQUEST opens the primary request; PARAMS records
/// build its HTTP semantics, STDIN records its body. This engine does
/// not multiplex: BEGIN_REQUESTs for any other id are remembered and
/// rejected with CANT_MPX_CONN when the primary request completes.
pub(crate) struct FastCgiProcessor {
    delegate: Arc<dyn ServerDelegate>,
    handler: Weak<SocketHandler>,
    raw: Vec<u8>,
    state: State,
    request_id: Option<u16>,
    keep_conn: bool,
    extra_request_ids: Vec<u16>,

    method: Option<String>,
    scheme: Option<String>,
    host: Option<String>,
    server_addr: Option<String>,
    server_name: Option<String>,
    server_port: Option<String>,
    request_uri: Option<String>,
    remote_addr: Option<String>,
    http_version: (u16, u16),
    headers: HeadersContainer,
    body: BufferList,

    active: bool,
    in_progress: bool,
    keep_alive_until: Option<Instant>,
    remote: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    AwaitingBegin,
    Params,
    Body,
    Dispatched,
    Done,
}

impl FastCgiProcessor {
    pub(crate) fn new(
        delegate: Arc<dyn ServerDelegate>,
        options: Arc<ServerOptions>,
    ) -> FastCgiProcessor {
        let keep_alive_until = Some(Instant::now() + options.keep_alive_timeout);
        FastCgiProcessor {
            delegate,
            handler: Weak::new(),
            raw: Vec::new(),
            state: State::AwaitingBegin,
            request_id: None,
            keep_conn: false,
            extra_request_ids: Vec::new(),
            method: None,
            scheme: None,
            host: None,
            server_addr: None,
            server_name: None,
            server_port: None,
            request_uri: None,
            remote_addr: None,
            http_version: (1, 1),
            headers: HeadersContainer::new(),
            body: BufferList::new(),
            active: true,
            in_progress: false,
            keep_alive_until,
            remote: String::new(),
        }
    }

    fn fail_connection(&mut self, why: &str) {
        debug!("FastCGI protocol error from {}: {}", self.remote, why);
        if let Some(handler) = self.handler.upgrade() {
            handler.prepare_to_close();
        }
        self.state = State::Done;
        self.in_progress = false;
    }

    fn reject_role(&mut self, request_id: u16) {
        debug!("unsupported FastCGI role on request {}", request_id);
        if let Some(handler) = self.handler.upgrade() {
            handler.write(&record::encode_end_request(
                request_id,
                0,
                ProtocolStatus::UnknownRole,
            ));
            handler.prepare_to_close();
        }
        self.state = State::Done;
        self.in_progress = false;
    }

    fn handle_record(&mut self, record: Record) {
        match record {
            Record::BeginRequest {
                request_id, flags, ..
            } => match self.request_id {
                None => {
                    self.request_id = Some(request_id);
                    self.keep_conn = flags & record::FLAG_KEEP_CONN != 0;
                    trace!(
                        "FastCGI request {} opened (keep_conn={})",
                        request_id,
                        self.keep_conn
                    );
                    self.state = State::Params;
                    self.in_progress = true;
                }
                Some(primary) if primary == request_id => {
                    self.fail_connection("duplicate BEGIN_REQUEST for the open request");
                }
                Some(_) => {
                    if !self.extra_request_ids.contains(&request_id) {
                        trace!("multiplexed request {} queued for rejection", request_id);
                        self.extra_request_ids.push(request_id);
                    }
                }
            },
            Record::Params { request_id, params } => {
                if self.request_id != Some(request_id) {
                    return; // parameters of a rejected multiplexed request
                }
                if self.state != State::Params {
                    self.fail_connection("PARAMS after headers completed");
                    return;
                }
                if params.is_empty() {
                    self.state = State::Body;
                } else {
                    for (name, value) in params {
                        self.apply_param(&name, value);
                    }
                }
            }
            Record::Stdin { request_id, data } => {
                if self.request_id != Some(request_id) {
                    return;
                }
                match self.state {
                    // tolerate upstreams that skip the empty PARAMS
                    State::Params => self.state = State::Body,
                    State::Body => {}
                    _ => {
                        self.fail_connection("STDIN outside an open request");
                        return;
                    }
                }
                if data.is_empty() {
                    self.state = State::Dispatched;
                    self.dispatch();
                } else {
                    self.body.append(&data);
                }
            }
            Record::EndRequest { .. } | Record::Stdout { .. } => {
                self.fail_connection("unexpected application-to-server record");
            }
        }
    }

    fn apply_param(&mut self, name: &str, value: String) {
        match name {
            "REQUEST_METHOD" => self.method = Some(value),
            "REQUEST_SCHEME" => self.scheme = Some(value),
            "HTTP_HOST" => {
                self.headers.append("Host", value.clone());
                self.host = Some(value);
            }
            "SERVER_ADDR" => self.server_addr = Some(value),
            "SERVER_NAME" => self.server_name = Some(value),
            "SERVER_PORT" => self.server_port = Some(value),
            "REQUEST_URI" => self.request_uri = Some(value),
            "REMOTE_ADDR" => self.remote_addr = Some(value),
            "SERVER_PROTOCOL" => {
                if let Some(version) = parse_protocol(&value) {
                    self.http_version = version;
                }
            }
            _ => {
                if let Some(raw) = name.strip_prefix("HTTP_") {
                    self.headers.append(&normalize_header_name(raw), value);
                }
            }
        }
    }

    /// `scheme://host[:port]/uri`, the port omitted for 80/443, with the
    /// host falling back HTTP_HOST → SERVER_NAME → SERVER_ADDR →
    /// 127.0.0.1.
    fn reconstruct_url(&self) -> String {
        let scheme = self.scheme.as_deref().unwrap_or("http");
        let host = self
            .host
            .as_deref()
            .or(self.server_name.as_deref())
            .or(self.server_addr.as_deref())
            .unwrap_or("127.0.0.1");
        let uri = self.request_uri.as_deref().unwrap_or("/");
        let port = self
            .server_port
            .as_deref()
            .filter(|p| !p.is_empty() && *p != "80" && *p != "443")
            .filter(|_| !host.contains(':'));
        match port {
            Some(port) => format!("{}://{}:{}{}", scheme, host, port, uri),
            None => format!("{}://{}{}", scheme, host, uri),
        }
    }

    fn dispatch(&mut self) {
        let request_id = match self.request_id {
            Some(id) => id,
            None => return,
        };
        let method = self
            .method
            .as_deref()
            .and_then(|m| Method::from_str(m).ok())
            .unwrap_or_default();
        let target = self.request_uri.clone().unwrap_or_else(|| "/".to_owned());
        let url = self.reconstruct_url();
        let remote = self
            .remote_addr
            .clone()
            .unwrap_or_else(|| self.remote.clone());
        let headers = std::mem::take(&mut self.headers);
        let mut body = BufferList::new();
        self.body.fill_buffer(&mut body);

        trace!("dispatching FastCGI request {} {}", method.as_str(), url);
        let request = ServerRequest::new(
            method,
            target,
            url,
            self.http_version,
            headers,
            remote,
            body,
        );
        let response = ServerResponse::new(
            ResponseChannel::Fcgi {
                handler: self.handler.clone(),
                request_id,
                extra_request_ids: self.extra_request_ids.clone(),
            },
            KeepAlivePlan::none(),
        );
        let delegate = self.delegate.clone();
        tokio::task::spawn_blocking(move || {
            let mut request = request;
            let mut response = response;
            delegate.handle(&mut request, &mut response);
            if !response.ended() {
                if let Err(e) = response.end() {
                    debug!("implicit FastCGI response end failed: {}", e);
                }
            }
        });
    }
}

impl ConnectionProcessor for FastCgiProcessor {
    fn process(&mut self, buffer: &mut BufferList) -> bool {
        if !self.active || self.state == State::Done {
            buffer.advance(buffer.remaining());
            return true;
        }
        buffer.fill_vec(&mut self.raw);
        let mut pos = 0;
        loop {
            match record::parse_one(&self.raw[pos..]) {
                Ok((record, consumed)) => {
                    pos += consumed;
                    self.handle_record(record);
                    if self.state == State::Done {
                        pos = self.raw.len();
                        break;
                    }
                }
                Err(ParseError::BufferExhausted) => break,
                Err(ParseError::UnsupportedRole { request_id }) => {
                    self.reject_role(request_id);
                    pos = self.raw.len();
                    break;
                }
                Err(e) => {
                    self.fail_connection(&format!("{:?}", e));
                    pos = self.raw.len();
                    break;
                }
            }
        }
        self.raw.drain(..pos);
        true
    }

    fn socket_closed(&mut self) {
        if !self.active {
            return;
        }
        if self.in_progress && self.state != State::Dispatched {
            debug!("FastCGI upstream {} disconnected mid-request", self.remote);
        }
        if self.state != State::Dispatched {
            self.state = State::Done;
            self.in_progress = false;
        }
    }

    fn response_ended(&mut self, _keep_alive: bool) {
        if !self.active {
            return;
        }
        // the responder never reuses the transport, even with KEEP_CONN
        self.state = State::Done;
        self.in_progress = false;
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

impl std::fmt::Debug for FastCgiProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastCgiProcessor")
            .field("state", &self.state)
            .field("request_id", &self.request_id)
            .field("extra_request_ids", &self.extra_request_ids)
            .finish()
    }
}

/// Parses `HTTP/M.N` out of SERVER_PROTOCOL.
fn parse_protocol(value: &str) -> Option<(u16, u16)> {
    let rest = value.strip_prefix("HTTP/")?;
    let mut parts = rest.splitn(2, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// `HTTP_USER_AGENT` → `User-Agent`: underscores become dashes and each
/// word is title-cased.
fn normalize_header_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, word) in raw.split('_').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = word.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            for c in chars {
                out.extend(c.to_lowercase());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{ServerRequest, ServerResponse};

    fn processor() -> FastCgiProcessor {
        let delegate =
            Arc::new(|_req: &mut ServerRequest, _res: &mut ServerResponse| {});
        FastCgiProcessor::new(delegate, Arc::new(ServerOptions::new()))
    }

    #[test]
    fn url_fallback_order() {
        let mut p = processor();
        p.request_uri = Some("/x".to_owned());
        assert_eq!(p.reconstruct_url(), "http://127.0.0.1/x");

        p.server_addr = Some("10.0.0.9".to_owned());
        assert_eq!(p.reconstruct_url(), "http://10.0.0.9/x");

        p.server_name = Some("internal".to_owned());
        assert_eq!(p.reconstruct_url(), "http://internal/x");

        p.host = Some("example.org".to_owned());
        assert_eq!(p.reconstruct_url(), "http://example.org/x");
    }

    #[test]
    fn default_ports_are_omitted() {
        let mut p = processor();
        p.host = Some("h".to_owned());
        p.request_uri = Some("/".to_owned());
        p.server_port = Some("80".to_owned());
        assert_eq!(p.reconstruct_url(), "http://h/");
        p.server_port = Some("443".to_owned());
        assert_eq!(p.reconstruct_url(), "http://h/");
        p.server_port = Some("8080".to_owned());
        assert_eq!(p.reconstruct_url(), "http://h:8080/");
    }

    #[test]
    fn host_with_explicit_port_is_left_alone() {
        let mut p = processor();
        p.host = Some("h:9090".to_owned());
        p.request_uri = Some("/".to_owned());
        p.server_port = Some("9090".to_owned());
        assert_eq!(p.reconstruct_url(), "http://h:9090/");
    }

    #[test]
    fn params_build_http_semantics() {
        let mut p = processor();
        p.apply_param("REQUEST_METHOD", "PUT".to_owned());
        p.apply_param("REQUEST_SCHEME", "https".to_owned());
        p.apply_param("HTTP_HOST", "example.org".to_owned());
        p.apply_param("SERVER_PROTOCOL", "HTTP/1.0".to_owned());
        p.apply_param("HTTP_USER_AGENT", "tester".to_owned());
        p.apply_param("REMOTE_ADDR", "192.0.2.1".to_owned());

        assert_eq!(p.method.as_deref(), Some("PUT"));
        assert_eq!(p.scheme.as_deref(), Some("https"));
        assert_eq!(p.http_version, (1, 0));
        assert_eq!(p.headers.get_first("Host"), Some("example.org"));
        assert_eq!(p.headers.get_first("User-Agent"), Some("tester"));
        assert_eq!(p.remote_addr.as_deref(), Some("192.0.2.1"));
    }

    #[tokio::test]
    async fn extra_request_ids_are_tracked() {
        let mut p = processor();
        p.handle_record(Record::BeginRequest {
            request_id: 1,
            role: record::ROLE_RESPONDER,
            flags: 0,
        });
        assert_eq!(p.request_id, Some(1));
        assert_eq!(p.state, State::Params);

        p.handle_record(Record::BeginRequest {
            request_id: 2,
            role: record::ROLE_RESPONDER,
            flags: 0,
        });
        p.handle_record(Record::BeginRequest {
            request_id: 2,
            role: record::ROLE_RESPONDER,
            flags: 0,
        });
        assert_eq!(p.extra_request_ids, vec![2]);
        // parameters for the rejected id are ignored
        p.handle_record(Record::Params {
            request_id: 2,
            params: vec![("REQUEST_METHOD".to_owned(), "GET".to_owned())],
        });
        assert!(p.method.is_none());
    }

    #[tokio::test]
    async fn duplicate_begin_request_is_a_protocol_error() {
        let mut p = processor();
        p.handle_record(Record::BeginRequest {
            request_id: 1,
            role: record::ROLE_RESPONDER,
            flags: 0,
        });
        p.handle_record(Record::BeginRequest {
            request_id: 1,
            role: record::ROLE_RESPONDER,
            flags: 0,
        });
        assert_eq!(p.state, State::Done);
    }

    #[tokio::test]
    async fn empty_params_then_stdin_completes() {
        let mut p = processor();
        p.handle_record(Record::BeginRequest {
            request_id: 1,
            role: record::ROLE_RESPONDER,
            flags: 0,
        });
        p.handle_record(Record::Params {
            request_id: 1,
            params: vec![
                ("REQUEST_METHOD".to_owned(), "POST".to_owned()),
                ("REQUEST_URI".to_owned(), "/a".to_owned()),
            ],
        });
        p.handle_record(Record::Params {
            request_id: 1,
            params: vec![],
        });
        assert_eq!(p.state, State::Body);
        p.handle_record(Record::Stdin {
            request_id: 1,
            data: bytes::Bytes::from_static(b"body"),
        });
        assert_eq!(p.state, State::Body);
        p.handle_record(Record::Stdin {
            request_id: 1,
            data: bytes::Bytes::new(),
        });
        assert_eq!(p.state, State::Dispatched);
    }

    #[test]
    fn header_name_normalization() {
        assert_eq!(normalize_header_name("USER_AGENT"), "User-Agent");
        assert_eq!(normalize_header_name("ACCEPT"), "Accept");
        assert_eq!(
            normalize_header_name("X_FORWARDED_FOR"),
            "X-Forwarded-For"
        );
    }

    #[test]
    fn protocol_parse() {
        assert_eq!(parse_protocol("HTTP/1.1"), Some((1, 1)));
        assert_eq!(parse_protocol("HTTP/1.0"), Some((1, 0)));
        assert_eq!(parse_protocol("SPDY/3"), None);
        assert_eq!(parse_protocol("HTTP/x.y"), None);
    }
}
