//! FastCGI responder-side protocol support.
//!
//! The wire unit is the 8-byte-header framed [`record`]; the
//! [`processor`](crate::server::FastCgiServer) side assembles HTTP
//! semantics out of `PARAMS` and `STDIN` records and answers with
//! `STDOUT` records followed by `END_REQUEST`.

pub mod record;

pub(crate) mod processor;
pub(crate) mod response;
