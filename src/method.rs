//! The HTTP request method

use std::fmt;
use std::str::FromStr;

use self::Method::{
    Connect, Delete, Extension, Get, Head, Options, Patch, Post, Put, Trace,
};

/// The request method (VERB).
///
/// Includes the 8 methods of RFC 7231 plus PATCH, and an `Extension`
/// variant carrying any other verb a peer sends.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Method {
    /// OPTIONS
    Options,
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// TRACE
    Trace,
    /// CONNECT
    Connect,
    /// PATCH
    Patch,
    /// A custom verb, e.g. `Extension("PROPFIND".to_owned())`.
    Extension(String),
}

impl Method {
    /// Whether a method is considered "safe", meaning the request is
    /// essentially read-only.
    pub fn safe(&self) -> bool {
        matches!(*self, Get | Head | Options | Trace)
    }

    /// Whether requests with this method normally carry a body the
    /// sender should declare.
    pub fn declares_body(&self) -> bool {
        matches!(*self, Post | Put | Patch)
    }

    /// The method as the exact token sent on the wire.
    pub fn as_str(&self) -> &str {
        match *self {
            Options => "OPTIONS",
            Get => "GET",
            Post => "POST",
            Put => "PUT",
            Delete => "DELETE",
            Head => "HEAD",
            Trace => "TRACE",
            Connect => "CONNECT",
            Patch => "PATCH",
            Extension(ref s) => s.as_str(),
        }
    }
}

impl FromStr for Method {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Method, crate::Error> {
        if s.is_empty() {
            return Err(crate::Error::new_parse(crate::error::Parse::Method));
        }
        Ok(match s {
            "OPTIONS" => Options,
            "GET" => Get,
            "POST" => Post,
            "PUT" => Put,
            "DELETE" => Delete,
            "HEAD" => Head,
            "TRACE" => Trace,
            "CONNECT" => Connect,
            "PATCH" => Patch,
            _ => Extension(s.to_owned()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Method {
    fn default() -> Method {
        Get
    }
}
