use crate::buffer::BufferList;
use crate::headers::HeadersContainer;
use crate::parse::HttpParser;
use crate::status::StatusCode;

/// A complete response delivered by [`ClientRequest::end`][end].
///
/// [end]: super::ClientRequest::end
pub struct ClientResponse {
    status: StatusCode,
    status_raw: u16,
    reason: String,
    http_major: u16,
    http_minor: u16,
    headers: HeadersContainer,
    body: BufferList,
}

impl ClientResponse {
    pub(crate) fn from_parser(parser: &mut HttpParser) -> ClientResponse {
        let mut body = BufferList::new();
        parser.body_mut().fill_buffer(&mut body);
        let (http_major, http_minor) = parser.http_version();
        ClientResponse {
            status: parser.status_code(),
            status_raw: parser.status_raw(),
            reason: parser.reason().to_owned(),
            http_major,
            http_minor,
            headers: parser.take_headers(),
            body,
        }
    }

    /// The status by programmatic name; `Unknown` when the peer sent a
    /// code outside the recognized set (see [`status`](Self::status)).
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// The numeric status exactly as received.
    pub fn status(&self) -> u16 {
        self.status_raw
    }

    /// The reason phrase from the status line.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// `(major, minor)` of the response's HTTP version.
    pub fn http_version(&self) -> (u16, u16) {
        (self.http_major, self.http_minor)
    }

    /// The response headers.
    pub fn headers(&self) -> &HeadersContainer {
        &self.headers
    }

    /// Reads body bytes into `buf`, returning how many were copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.body.fill(buf)
    }

    /// Appends the rest of the body to `buf`, returning the count.
    pub fn read_all(&mut self, buf: &mut Vec<u8>) -> usize {
        self.body.fill_vec(buf)
    }

    /// Reads the rest of the body as a UTF-8 string.
    pub fn read_string(&mut self) -> crate::Result<String> {
        let mut bytes = Vec::new();
        self.body.fill_vec(&mut bytes);
        String::from_utf8(bytes)
            .map_err(|e| crate::Error::new_parse(crate::error::Parse::Internal).with(e))
    }
}

impl std::fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientResponse")
            .field("status", &self.status_raw)
            .field("reason", &self.reason)
            .field("headers", &self.headers.len())
            .finish()
    }
}
