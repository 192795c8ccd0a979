use std::collections::HashMap;

use crate::buffer::BufferList;
use crate::headers::HeadersContainer;
use crate::method::Method;

/// A fully parsed incoming request, handed to the
/// [`ServerDelegate`](super::ServerDelegate).
///
/// The body has already been framed off the wire when the delegate runs;
/// the `read` family drains it like a stream. Reads past the end return
/// zero, including when the peer hung up mid-connection.
pub struct ServerRequest {
    method: Method,
    target: String,
    url: String,
    http_major: u16,
    http_minor: u16,
    headers: HeadersContainer,
    remote_address: String,
    body: BufferList,
}

impl ServerRequest {
    pub(crate) fn new(
        method: Method,
        target: String,
        url: String,
        http_version: (u16, u16),
        headers: HeadersContainer,
        remote_address: String,
        body: BufferList,
    ) -> ServerRequest {
        ServerRequest {
            method,
            target,
            url,
            http_major: http_version.0,
            http_minor: http_version.1,
            headers,
            remote_address,
            body,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request-target exactly as it appeared on the wire.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The request URL, absolute where the message gave enough to
    /// reconstruct one (`Host` header, or FastCGI parameters).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// `(major, minor)` of the request's HTTP version.
    pub fn http_version(&self) -> (u16, u16) {
        (self.http_major, self.http_minor)
    }

    /// The request headers.
    pub fn headers(&self) -> &HeadersContainer {
        &self.headers
    }

    /// The remote endpoint, rendered for logs.
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    /// Query parameters, split on `&` then `=`. A key without `=` maps
    /// to the empty string; a repeated key keeps the last value.
    pub fn query_parameters(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        if let Some(query) = self.target.splitn(2, '?').nth(1) {
            for pair in query.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let mut kv = pair.splitn(2, '=');
                let key = kv.next().unwrap_or("").to_owned();
                let value = kv.next().unwrap_or("").to_owned();
                params.insert(key, value);
            }
        }
        params
    }

    /// Reads body bytes into `buf`, returning how many were copied.
    /// Zero means the body is exhausted.
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

impl std::fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRequest")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("http_version", &(self.http_major, self.http_minor))
            .field("remote", &self.remote_address)
            .finish()
    }
}

/// Builds the absolute URL for a plain HTTP request from its target and
/// `Host` header, falling back to the bare target when no host is known.
pub(crate) fn reconstruct_url(target: &str, headers: &HeadersContainer) -> String {
    match headers.get_first("Host") {
        Some(host) => format!("http://{}{}", host, target),
        None => target.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn request(target: &str, body: &[u8]) -> ServerRequest {
        let mut buf = BufferList::new();
        buf.append(body);
        ServerRequest::new(
            Method::from_str("GET").unwrap(),
            target.to_owned(),
            target.to_owned(),
            (1, 1),
            HeadersContainer::new(),
            "127.0.0.1:9".to_owned(),
            buf,
        )
    }

    #[test]
    fn query_parameters_split() {
        let req = request("/p?a=1&b=two&flag&c=", b"");
        let params = req.query_parameters();
        assert_eq!(params.get("a").map(String::as_str), Some("1"));
        assert_eq!(params.get("b").map(String::as_str), Some("two"));
        assert_eq!(params.get("flag").map(String::as_str), Some(""));
        assert_eq!(params.get("c").map(String::as_str), Some(""));
    }

    #[test]
    fn no_query_is_empty() {
        assert!(request("/p", b"").query_parameters().is_empty());
    }

    #[test]
    fn body_reads_drain() {
        let mut req = request("/", b"some body");
        let mut chunk = [0u8; 4];
        assert_eq!(req.read(&mut chunk), 4);
        assert_eq!(&chunk, b"some");
        assert_eq!(req.read_string().unwrap(), " body");
        assert_eq!(req.read(&mut chunk), 0);
    }

    #[test]
    fn url_reconstruction_uses_host() {
        let mut headers = HeadersContainer::new();
        headers.set_value("Host", "example.org");
        assert_eq!(
            reconstruct_url("/x?y=1", &headers),
            "http://example.org/x?y=1"
        );
        assert_eq!(reconstruct_url("/x", &HeadersContainer::new()), "/x");
    }
}
