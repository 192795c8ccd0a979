//! The HTTP client engine.
//!
//! [`ClientRequest`] builds an outgoing HTTP/1.x request from a URL or
//! an options record, follows redirects (downgrading to `GET` on
//! `303 See Other`), attaches Basic authorization, suppresses
//! `100-continue`, skips interim response preambles, and tolerates
//! `HTTP/2` status lines by rewriting them to `HTTP/2.0` before
//! parsing.

mod request;
mod response;

pub use self::request::{parse_query, ClientRequest, ClientRequestOptions};
pub use self::response::ClientResponse;
