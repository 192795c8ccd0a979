//! Body framing decoders.

use std::fmt;

use tracing::trace;

use crate::buffer::BufferList;
use crate::error::Parse;
use crate::Error;

use self::Kind::{Chunked, Eof, Length};

/// Decoders to handle different Transfer-Encodings.
///
/// If a message body does not include a Transfer-Encoding, it *should*
/// include a Content-Length header.
#[derive(Clone, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum Kind {
    /// A decoder for a body framed by a Content-Length header.
    Length(u64),
    /// A decoder for a `Transfer-Encoding: chunked` body.
    Chunked { state: ChunkedState, chunk_len: u64 },
    /// A decoder for responses that indicate neither a length nor
    /// chunking: the body runs until the transport closes.
    ///
    /// The bool tracks whether EOF has been observed. Requests are never
    /// framed this way.
    Eof(bool),
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Start,
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

impl Decoder {
    pub(crate) fn length(x: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(x),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Start,
                chunk_len: 0,
            },
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder {
            kind: Kind::Eof(false),
        }
    }

    /// Whether the body has been fully decoded.
    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Length(0)
                | Chunked {
                    state: ChunkedState::End,
                    ..
                }
                | Eof(true)
        )
    }

    /// Notes that the transport reached EOF. Completes a close-delimited
    /// body; any other kind mid-body is a truncation.
    pub(crate) fn on_socket_eof(&mut self) -> crate::Result<()> {
        match self.kind {
            Eof(ref mut seen) => {
                *seen = true;
                Ok(())
            }
            _ if self.is_eof() => Ok(()),
            _ => Err(Error::new_incomplete()),
        }
    }

    /// Decodes body bytes out of `buf` into `sink`, returning how many
    /// input bytes were consumed. Consumption stops at the end of the
    /// message body; the caller owns the remainder.
    pub(crate) fn decode(
        &mut self,
        buf: &[u8],
        sink: &mut BufferList,
    ) -> crate::Result<usize> {
        trace!("decode; state={:?}", self.kind);
        match self.kind {
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                sink.append(&buf[..take]);
                *remaining -= take as u64;
                Ok(take)
            }
            Chunked {
                ref mut state,
                ref mut chunk_len,
            } => {
                let mut pos = 0;
                while pos < buf.len() && *state != ChunkedState::End {
                    let step = state.step(&buf[pos..], chunk_len, sink)?;
                    pos += step;
                }
                Ok(pos)
            }
            Eof(seen) => {
                if seen {
                    Ok(0)
                } else {
                    sink.append(buf);
                    Ok(buf.len())
                }
            }
        }
    }
}

impl fmt::Debug for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind, f)
    }
}

impl fmt::Display for Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Length(n) => write!(f, "content-length ({} bytes)", n),
            Chunked { .. } => f.write_str("chunked encoding"),
            Eof(_) => f.write_str("until close"),
        }
    }
}

macro_rules! byte (
    ($rdr:expr) => ({
        $rdr[0]
    })
);

impl ChunkedState {
    /// Consumes bytes from the front of `buf`, returning how many were
    /// taken in this step and mutating `self` to the follow state.
    fn step(
        &mut self,
        buf: &[u8],
        size: &mut u64,
        sink: &mut BufferList,
    ) -> crate::Result<usize> {
        use self::ChunkedState::*;
        match *self {
            Start => {
                let b = byte!(buf);
                match b {
                    b'0'..=b'9' => *size = (b - b'0') as u64,
                    b'a'..=b'f' => *size = (b + 10 - b'a') as u64,
                    b'A'..=b'F' => *size = (b + 10 - b'A') as u64,
                    _ => {
                        trace!("invalid chunk size start: {:?}", b);
                        return Err(Error::new_parse(Parse::Header));
                    }
                }
                *self = Size;
                Ok(1)
            }
            Size => {
                let b = byte!(buf);
                // u64::MAX / 16, leaving room for one more hex digit
                const RADIX_CAP: u64 = u64::MAX / 16;
                if *size > RADIX_CAP {
                    trace!("chunk size would overflow");
                    return Err(Error::new_parse(Parse::Header));
                }
                match b {
                    b'0'..=b'9' => *size = *size * 16 + (b - b'0') as u64,
                    b'a'..=b'f' => *size = *size * 16 + (b + 10 - b'a') as u64,
                    b'A'..=b'F' => *size = *size * 16 + (b + 10 - b'A') as u64,
                    b'\t' | b' ' => *self = SizeLws,
                    b';' => *self = Extension,
                    b'\r' => *self = SizeLf,
                    _ => {
                        trace!("invalid chunk size char: {:?}", b);
                        return Err(Error::new_parse(Parse::Header));
                    }
                }
                Ok(1)
            }
            SizeLws => {
                match byte!(buf) {
                    b'\t' | b' ' => {}
                    b';' => *self = Extension,
                    b'\r' => *self = SizeLf,
                    _ => return Err(Error::new_parse(Parse::Header)),
                }
                Ok(1)
            }
            Extension => {
                match byte!(buf) {
                    b'\r' => *self = SizeLf,
                    // LF inside an extension would desynchronize framing
                    b'\n' => return Err(Error::new_parse(Parse::Header)),
                    _ => {}
                }
                Ok(1)
            }
            SizeLf => {
                if byte!(buf) != b'\n' {
                    return Err(Error::new_parse(Parse::Header));
                }
                if *size == 0 {
                    *self = EndCr;
                } else {
                    trace!("chunk size is {}", size);
                    *self = Body;
                }
                Ok(1)
            }
            Body => {
                let take = std::cmp::min(*size, buf.len() as u64) as usize;
                sink.append(&buf[..take]);
                *size -= take as u64;
                if *size == 0 {
                    *self = BodyCr;
                }
                Ok(take)
            }
            BodyCr => {
                if byte!(buf) != b'\r' {
                    return Err(Error::new_parse(Parse::Header));
                }
                *self = BodyLf;
                Ok(1)
            }
            BodyLf => {
                if byte!(buf) != b'\n' {
                    return Err(Error::new_parse(Parse::Header));
                }
                *self = Start;
                Ok(1)
            }
            EndCr => {
                match byte!(buf) {
                    b'\r' => *self = EndLf,
                    _ => *self = Trailer,
                }
                Ok(1)
            }
            Trailer => {
                match byte!(buf) {
                    b'\r' => *self = TrailerLf,
                    _ => {}
                }
                Ok(1)
            }
            TrailerLf => {
                if byte!(buf) != b'\n' {
                    return Err(Error::new_parse(Parse::Header));
                }
                *self = EndCr;
                Ok(1)
            }
            EndLf => {
                if byte!(buf) != b'\n' {
                    return Err(Error::new_parse(Parse::Header));
                }
                *self = End;
                Ok(1)
            }
            End => Ok(0),
        }
    }
}
