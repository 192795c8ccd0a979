#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # shoal
//!
//! shoal is a low-level HTTP/1.x and FastCGI networking library: it
//! accepts TCP and Unix-domain connections, multiplexes reads and writes
//! with non-blocking I/O, drives protocol parsers to completion, and
//! dispatches fully-parsed requests to a user-supplied delegate while
//! honoring keep-alive, connection upgrades, request-size limits, and
//! graceful shutdown.
//!
//! ## Servers
//!
//! [`HttpServer`](server::HttpServer) speaks HTTP/1.x directly;
//! [`FastCgiServer`](server::FastCgiServer) speaks the FastCGI responder
//! protocol behind a front-end web server. Both hand every parsed request
//! to a [`ServerDelegate`](server::ServerDelegate) running on a worker
//! pool, never on an I/O thread.
//!
//! ## Client
//!
//! [`ClientRequest`](client::ClientRequest) builds outgoing HTTP/1.x
//! requests, follows redirects, and handles Basic authorization and
//! `HTTP/2` status-line compatibility.
//!
//! ## "Low-level"
//!
//! shoal is a building block, not a framework: routing, TLS layering, and
//! request handlers live above it.

pub use crate::error::{Error, Result};

pub mod buffer;
pub mod client;
mod common;
mod error;
pub mod fastcgi;
pub mod headers;
pub mod method;
mod parse;
pub mod server;
pub mod status;

pub use crate::buffer::BufferList;
pub use crate::headers::HeadersContainer;
pub use crate::method::Method;
pub use crate::status::StatusCode;
