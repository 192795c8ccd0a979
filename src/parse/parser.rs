use std::str::FromStr;

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::buffer::BufferList;
use crate::headers::HeadersContainer;
use crate::method::Method;
use crate::status::StatusCode;

use super::decode::Decoder;

const MAX_HEADERS: usize = 100;

/// Whether the parser expects to read requests or responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ParseMode {
    Request,
    Response,
}

/// An incremental HTTP/1.x message parser.
///
/// Bytes are fed through [`execute`](HttpParser::execute) in whatever
/// batches the transport produces. The parser accumulates the head until
/// it is complete, then frames the body with a [`Decoder`]. When a
/// message completes, `execute` stops consuming: the caller recovers the
/// unconsumed tail and decides whether to [`reset`](HttpParser::reset)
/// for a keep-alive successor or tear the connection down.
///
/// `execute` itself never fails. Malformed input parks the parser in a
/// failed state where it consumes nothing, which the driver observes as
/// `consumed < len` without completion.
pub(crate) struct HttpParser {
    mode: ParseMode,
    skip_body: bool,
    stage: Stage,
    head_buf: BytesMut,
    failed: bool,

    method: Option<Method>,
    url_bytes: Vec<u8>,
    url_string: String,
    http_major: u16,
    http_minor: u16,
    status_code: StatusCode,
    status_raw: u16,
    reason: String,
    headers: HeadersContainer,
    body: BufferList,
    headers_complete: bool,
    completed: bool,
    keep_alive: bool,
    upgrade: bool,

    last_header_field: Vec<u8>,
    last_header_value: Vec<u8>,
    last_chunk_was_value: bool,
    version_override: Option<(u16, u16)>,
}

#[derive(Debug)]
enum Stage {
    Head,
    Body(Decoder),
    Complete,
}

impl HttpParser {
    pub(crate) fn new(mode: ParseMode, skip_body: bool) -> HttpParser {
        HttpParser {
            mode,
            skip_body,
            stage: Stage::Head,
            head_buf: BytesMut::new(),
            failed: false,
            method: None,
            url_bytes: Vec::new(),
            url_string: String::new(),
            http_major: 1,
            http_minor: 1,
            status_code: StatusCode::Unknown,
            status_raw: 0,
            reason: String::new(),
            headers: HeadersContainer::new(),
            body: BufferList::new(),
            headers_complete: false,
            completed: false,
            keep_alive: false,
            upgrade: false,
            last_header_field: Vec::new(),
            last_header_value: Vec::new(),
            last_chunk_was_value: false,
            version_override: None,
        }
    }

    /// Feeds `bytes` to the parser. Returns `(consumed, upgrade)`.
    ///
    /// `consumed < bytes.len()` means either the message completed (check
    /// [`is_complete`](HttpParser::is_complete) and recover the tail) or
    /// the input was malformed.
    pub(crate) fn execute(&mut self, bytes: &[u8]) -> (usize, bool) {
        if self.failed || bytes.is_empty() {
            return (0, self.upgrade);
        }
        let mut consumed = 0;
        if let Stage::Head = self.stage {
            match self.execute_head(bytes) {
                Some(n) => consumed = n,
                None => return (0, self.upgrade),
            }
            if let Stage::Head = self.stage {
                // head still incomplete, everything was buffered
                return (consumed, self.upgrade);
            }
        }
        if let Stage::Body(ref mut decoder) = self.stage {
            match decoder.decode(&bytes[consumed..], &mut self.body) {
                Ok(n) => consumed += n,
                Err(_) => {
                    debug!("body decode failed");
                    self.failed = true;
                    return (0, self.upgrade);
                }
            }
            if decoder.is_eof() {
                self.finish_message();
            }
        }
        (consumed, self.upgrade)
    }

    /// Parses head bytes, buffering partial input. Returns the number of
    /// bytes of `input` consumed by the head, or `None` on malformed
    /// input (the parser is left failed).
    fn execute_head(&mut self, input: &[u8]) -> Option<usize> {
        let prior = self.head_buf.len();
        self.head_buf.extend_from_slice(input);
        // parse from a detached buffer so committing the head can borrow
        // the rest of self; restored below if the head is still partial
        let mut head_buf = std::mem::take(&mut self.head_buf);

        // the head parser only speaks HTTP/1.x; an HTTP/2.0 status line
        // (the client normalizes `HTTP/2 ` to this) is mapped through
        // 1.1 and the real version kept
        if self.mode == ParseMode::Response
            && head_buf.len() >= 9
            && &head_buf[..9] == b"HTTP/2.0 "
        {
            head_buf[..8].copy_from_slice(b"HTTP/1.1");
            self.version_override = Some((2, 0));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let head_len = match self.mode {
            ParseMode::Request => {
                let mut req = httparse::Request::new(&mut headers);
                trace!(
                    "Request.parse([Header; {}], [u8; {}])",
                    MAX_HEADERS,
                    head_buf.len()
                );
                match req.parse(&head_buf) {
                    Ok(httparse::Status::Complete(len)) => {
                        trace!("Request.parse Complete({})", len);
                        if self.commit_request_head(&req).is_none() {
                            self.failed = true;
                            return None;
                        }
                        len
                    }
                    Ok(httparse::Status::Partial) => {
                        self.head_buf = head_buf;
                        return Some(input.len());
                    }
                    Err(e) => {
                        debug!("request parse error: {:?}", e);
                        self.failed = true;
                        return None;
                    }
                }
            }
            ParseMode::Response => {
                let mut res = httparse::Response::new(&mut headers);
                match res.parse(&head_buf) {
                    Ok(httparse::Status::Complete(len)) => {
                        self.commit_response_head(&res);
                        len
                    }
                    Ok(httparse::Status::Partial) => {
                        self.head_buf = head_buf;
                        return Some(input.len());
                    }
                    Err(e) => {
                        debug!("response parse error: {:?}", e);
                        self.failed = true;
                        return None;
                    }
                }
            }
        };

        // `prior` bytes of the head arrived in earlier calls
        debug_assert!(head_len >= prior);
        let consumed = head_len - prior;
        self.on_headers_complete();
        Some(consumed)
    }

    fn commit_request_head(&mut self, req: &httparse::Request<'_, '_>) -> Option<()> {
        let method = Method::from_str(req.method?).ok()?;
        let path = req.path?;
        self.url_bytes = path.as_bytes().to_vec();
        self.url_string = path.to_owned();
        self.http_major = 1;
        self.http_minor = u16::from(req.version?);
        for header in req.headers.iter() {
            self.on_header_field(header.name.as_bytes());
            self.on_header_value(header.value);
        }
        self.method = Some(method);
        Some(())
    }

    fn commit_response_head(&mut self, res: &httparse::Response<'_, '_>) {
        if let Some((major, minor)) = self.version_override {
            self.http_major = major;
            self.http_minor = minor;
        } else {
            self.http_major = 1;
            self.http_minor = res.version.map(u16::from).unwrap_or(1);
        }
        self.status_raw = res.code.unwrap_or(0);
        self.status_code = StatusCode::from_u16(self.status_raw);
        self.reason = res.reason.unwrap_or("").to_owned();
        for header in res.headers.iter() {
            self.on_header_field(header.name.as_bytes());
            self.on_header_value(header.value);
        }
    }

    /// A header-name chunk arrived. Seeing a field after a value means
    /// the previous pair is finished and can be committed.
    fn on_header_field(&mut self, data: &[u8]) {
        if self.last_chunk_was_value {
            self.commit_header_pair();
        }
        self.last_header_field.extend_from_slice(data);
        self.last_chunk_was_value = false;
    }

    fn on_header_value(&mut self, data: &[u8]) {
        self.last_header_value.extend_from_slice(data);
        self.last_chunk_was_value = true;
    }

    fn commit_header_pair(&mut self) {
        if !self.last_header_field.is_empty() {
            let field = String::from_utf8_lossy(&self.last_header_field).into_owned();
            let value = String::from_utf8_lossy(&self.last_header_value).into_owned();
            self.headers.append(&field, value);
        }
        self.last_header_field.clear();
        self.last_header_value.clear();
        self.last_chunk_was_value = false;
    }

    fn on_headers_complete(&mut self) {
        self.commit_header_pair();
        self.headers_complete = true;
        self.keep_alive = self.compute_keep_alive();
        self.upgrade = self.compute_upgrade();

        let decoder = match self.body_decoder() {
            Some(d) => d,
            None => {
                self.failed = true;
                return;
            }
        };
        trace!("incoming body is {}", decoder);
        if decoder.is_eof() {
            self.stage = Stage::Body(decoder);
            self.finish_message();
        } else {
            self.stage = Stage::Body(decoder);
        }
    }

    fn body_decoder(&self) -> Option<Decoder> {
        match self.mode {
            ParseMode::Request => {
                if self.is_chunked() {
                    Some(Decoder::chunked())
                } else if let Some(value) = self.headers.get_first("Content-Length") {
                    match value.trim().parse::<u64>() {
                        Ok(len) => Some(Decoder::length(len)),
                        Err(_) => {
                            debug!("illegal Content-Length: {:?}", value);
                            None
                        }
                    }
                } else {
                    // requests without explicit framing have no body
                    Some(Decoder::length(0))
                }
            }
            ParseMode::Response => {
                if self.skip_body
                    || self.status_raw / 100 == 1
                    || self.status_raw == 204
                    || self.status_raw == 304
                {
                    Some(Decoder::length(0))
                } else if self.is_chunked() {
                    Some(Decoder::chunked())
                } else if let Some(value) = self.headers.get_first("Content-Length") {
                    match value.trim().parse::<u64>() {
                        Ok(len) => Some(Decoder::length(len)),
                        Err(_) => None,
                    }
                } else {
                    Some(Decoder::eof())
                }
            }
        }
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get_first("Transfer-Encoding")
            .map(|value| header_has_token(value, "chunked"))
            .unwrap_or(false)
    }

    fn compute_keep_alive(&self) -> bool {
        let connection = self.headers.get_first("Connection");
        match self.mode {
            // the server keeps a connection only when the client asked
            // for it by name
            ParseMode::Request => connection
                .map(|value| header_has_token(value, "keep-alive"))
                .unwrap_or(false),
            ParseMode::Response => {
                if self.http_minor >= 1 {
                    !connection
                        .map(|value| header_has_token(value, "close"))
                        .unwrap_or(false)
                } else {
                    connection
                        .map(|value| header_has_token(value, "keep-alive"))
                        .unwrap_or(false)
                }
            }
        }
    }

    fn compute_upgrade(&self) -> bool {
        match self.mode {
            ParseMode::Request => {
                if self.method == Some(Method::Connect) {
                    return true;
                }
                self.headers.contains("Upgrade")
                    && self
                        .headers
                        .get_first("Connection")
                        .map(|value| header_has_token(value, "upgrade"))
                        .unwrap_or(false)
            }
            ParseMode::Response => self.status_raw == 101,
        }
    }

    fn finish_message(&mut self) {
        trace!("message complete");
        self.stage = Stage::Complete;
        self.completed = true;
    }

    /// The transport reached EOF. Completes a close-delimited body;
    /// returns false if the message was cut short.
    pub(crate) fn on_socket_eof(&mut self) -> bool {
        match self.stage {
            Stage::Body(ref mut decoder) => {
                if decoder.on_socket_eof().is_ok() {
                    self.finish_message();
                    true
                } else {
                    false
                }
            }
            Stage::Complete => true,
            Stage::Head => self.head_buf.is_empty(),
        }
    }

    /// Clears all accumulators and reinitializes for the next message in
    /// the same mode.
    pub(crate) fn reset(&mut self) {
        self.stage = Stage::Head;
        self.head_buf.clear();
        self.failed = false;
        self.method = None;
        self.url_bytes.clear();
        self.url_string.clear();
        self.http_major = 1;
        self.http_minor = 1;
        self.status_code = StatusCode::Unknown;
        self.status_raw = 0;
        self.reason.clear();
        self.headers.clear();
        self.body.reset();
        self.headers_complete = false;
        self.completed = false;
        self.keep_alive = false;
        self.upgrade = false;
        self.last_header_field.clear();
        self.last_header_value.clear();
        self.last_chunk_was_value = false;
        self.version_override = None;
    }

    // accessors

    pub(crate) fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub(crate) fn url_bytes(&self) -> &[u8] {
        &self.url_bytes
    }

    pub(crate) fn url_string(&self) -> &str {
        &self.url_string
    }

    pub(crate) fn http_version(&self) -> (u16, u16) {
        (self.http_major, self.http_minor)
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub(crate) fn status_raw(&self) -> u16 {
        self.status_raw
    }

    pub(crate) fn reason(&self) -> &str {
        &self.reason
    }

    pub(crate) fn headers(&self) -> &HeadersContainer {
        &self.headers
    }

    pub(crate) fn take_headers(&mut self) -> HeadersContainer {
        std::mem::take(&mut self.headers)
    }

    pub(crate) fn body_mut(&mut self) -> &mut BufferList {
        &mut self.body
    }

    pub(crate) fn is_headers_complete(&self) -> bool {
        self.headers_complete
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.completed
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn is_upgrade(&self) -> bool {
        self.upgrade
    }
}

impl std::fmt::Debug for HttpParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpParser")
            .field("mode", &self.mode)
            .field("stage", &self.stage)
            .field("completed", &self.completed)
            .field("failed", &self.failed)
            .finish()
    }
}

/// Scans a comma-separated header value for a token, case-insensitively.
pub(crate) fn header_has_token(value: &str, needle: &str) -> bool {
    for token in value.split(',') {
        if token.trim().eq_ignore_ascii_case(needle) {
            return true;
        }
    }
    false
}
