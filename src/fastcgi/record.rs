//! The FastCGI record codec.
//!
//! A record is an 8-byte header followed by `content_length` bytes of
//! payload and `padding_length` bytes of padding:
//!
//! ```text
//! version | type | request_id (u16 BE) | content_length (u16 BE) | padding_length | reserved
//! ```
//!
//! Only protocol version 1 is spoken, and only the responder role is
//! accepted.

use bytes::Bytes;

/// The only FastCGI protocol version this library speaks.
pub const VERSION_1: u8 = 1;

/// The responder role; the only role accepted on decode.
pub const ROLE_RESPONDER: u16 = 1;

/// BEGIN_REQUEST flag bit asking the application to keep the connection.
pub const FLAG_KEEP_CONN: u8 = 1;

/// Largest payload a single record can carry.
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

const HEADER_LEN: usize = 8;

/// Record types used by the responder protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Opens a request on a connection.
    BeginRequest = 1,
    /// Closes a request, carrying an application and a protocol status.
    EndRequest = 3,
    /// A block of name/value parameters; an empty one ends the headers.
    Params = 4,
    /// Request body bytes; an empty one ends the body.
    Stdin = 5,
    /// Response body bytes; an empty one ends the response.
    Stdout = 6,
}

impl RecordType {
    fn from_u8(byte: u8) -> Option<RecordType> {
        match byte {
            1 => Some(RecordType::BeginRequest),
            3 => Some(RecordType::EndRequest),
            4 => Some(RecordType::Params),
            5 => Some(RecordType::Stdin),
            6 => Some(RecordType::Stdout),
            _ => None,
        }
    }
}

/// Protocol status carried by an END_REQUEST record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    /// The request finished normally.
    RequestComplete = 0,
    /// This connection cannot multiplex concurrent requests.
    CantMpxConn = 1,
    /// The application is out of capacity.
    Overloaded = 2,
    /// The requested role is not implemented.
    UnknownRole = 3,
}

/// A decoded FastCGI record.
#[derive(Clone, Debug, PartialEq)]
pub enum Record {
    /// BEGIN_REQUEST: opens request `request_id` with a role and flags.
    BeginRequest {
        request_id: u16,
        role: u16,
        flags: u8,
    },
    /// END_REQUEST: closes `request_id`.
    EndRequest {
        request_id: u16,
        app_status: u32,
        protocol_status: u8,
    },
    /// PARAMS: decoded name/value pairs; empty when `params` is empty.
    Params {
        request_id: u16,
        params: Vec<(String, String)>,
    },
    /// STDIN: request body bytes; empty data ends the body.
    Stdin { request_id: u16, data: Bytes },
    /// STDOUT: response body bytes.
    Stdout { request_id: u16, data: Bytes },
}

impl Record {
    /// The request id in this record's header.
    pub fn request_id(&self) -> u16 {
        match *self {
            Record::BeginRequest { request_id, .. }
            | Record::EndRequest { request_id, .. }
            | Record::Params { request_id, .. }
            | Record::Stdin { request_id, .. }
            | Record::Stdout { request_id, .. } => request_id,
        }
    }
}

/// Why a record could not be decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Not enough bytes buffered yet; read more and retry.
    BufferExhausted,
    /// The version byte was not 1.
    InvalidVersion,
    /// The type byte is not a record type this library speaks.
    InvalidType,
    /// BEGIN_REQUEST asked for a role other than responder. The id is
    /// kept so the caller can answer `END_REQUEST{UNKNOWN_ROLE}`.
    UnsupportedRole { request_id: u16 },
    /// The payload contradicts its own framing.
    ProtocolError,
}

/// Decodes one record off the front of `buf`.
///
/// Returns the record and the total number of bytes it occupied
/// (header + content + padding). `BufferExhausted` is the recoverable
/// "read more" signal; everything else is fatal for the connection.
pub fn parse_one(buf: &[u8]) -> Result<(Record, usize), ParseError> {
    if buf.len() < HEADER_LEN {
        return Err(ParseError::BufferExhausted);
    }
    if buf[0] != VERSION_1 {
        return Err(ParseError::InvalidVersion);
    }
    let rtype = RecordType::from_u8(buf[1]).ok_or(ParseError::InvalidType)?;
    let request_id = u16::from_be_bytes([buf[2], buf[3]]);
    let content_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let padding_len = buf[6] as usize;

    let total = HEADER_LEN + content_len + padding_len;
    if buf.len() < total {
        return Err(ParseError::BufferExhausted);
    }
    let content = &buf[HEADER_LEN..HEADER_LEN + content_len];

    let record = match rtype {
        RecordType::BeginRequest => {
            if content.len() < 3 {
                return Err(ParseError::ProtocolError);
            }
            let role = u16::from_be_bytes([content[0], content[1]]);
            if role != ROLE_RESPONDER {
                return Err(ParseError::UnsupportedRole { request_id });
            }
            Record::BeginRequest {
                request_id,
                role,
                flags: content[2],
            }
        }
        RecordType::EndRequest => {
            if content.len() < 5 {
                return Err(ParseError::ProtocolError);
            }
            Record::EndRequest {
                request_id,
                app_status: u32::from_be_bytes([
                    content[0], content[1], content[2], content[3],
                ]),
                protocol_status: content[4],
            }
        }
        RecordType::Params => Record::Params {
            request_id,
            params: parse_params(content)?,
        },
        RecordType::Stdin => Record::Stdin {
            request_id,
            data: Bytes::copy_from_slice(content),
        },
        RecordType::Stdout => Record::Stdout {
            request_id,
            data: Bytes::copy_from_slice(content),
        },
    };
    Ok((record, total))
}

/// Decodes a PARAMS payload: a run of `(name_len, value_len, name,
/// value)` entries. A length is one byte when its high bit is clear,
/// otherwise four bytes big-endian with the high bit masked off.
fn parse_params(mut content: &[u8]) -> Result<Vec<(String, String)>, ParseError> {
    let mut params = Vec::new();
    while !content.is_empty() {
        let (name_len, rest) = parse_param_len(content)?;
        let (value_len, rest) = parse_param_len(rest)?;
        if rest.len() < name_len + value_len {
            return Err(ParseError::ProtocolError);
        }
        let name = String::from_utf8_lossy(&rest[..name_len]).into_owned();
        let value =
            String::from_utf8_lossy(&rest[name_len..name_len + value_len]).into_owned();
        params.push((name, value));
        content = &rest[name_len + value_len..];
    }
    Ok(params)
}

fn parse_param_len(buf: &[u8]) -> Result<(usize, &[u8]), ParseError> {
    match buf.first() {
        Some(&b) if b & 0x80 == 0 => Ok((b as usize, &buf[1..])),
        Some(_) if buf.len() >= 4 => {
            let len = u32::from_be_bytes([buf[0] & 0x7f, buf[1], buf[2], buf[3]]);
            Ok((len as usize, &buf[4..]))
        }
        _ => Err(ParseError::ProtocolError),
    }
}

/// Encodes a record, padding the content out so that
/// `(content + padding) % 8 == 0`.
///
/// Fails with `OversizeData` when the content cannot fit the u16 length
/// field.
pub fn encode(rtype: RecordType, request_id: u16, content: &[u8]) -> crate::Result<Vec<u8>> {
    if content.len() > MAX_CONTENT_LEN {
        return Err(crate::Error::new_fcgi(crate::error::Fcgi::OversizeData));
    }
    let padding = (8 - content.len() % 8) % 8;
    let mut out = Vec::with_capacity(HEADER_LEN + content.len() + padding);
    out.push(VERSION_1);
    out.push(rtype as u8);
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.push(padding as u8);
    out.push(0); // reserved
    out.extend_from_slice(content);
    out.resize(out.len() + padding, 0);
    Ok(out)
}

/// Encodes a BEGIN_REQUEST record.
pub fn encode_begin_request(request_id: u16, role: u16, flags: u8) -> Vec<u8> {
    let mut content = [0u8; 8];
    content[..2].copy_from_slice(&role.to_be_bytes());
    content[2] = flags;
    encode(RecordType::BeginRequest, request_id, &content)
        .expect("begin-request content is fixed size")
}

/// Encodes an END_REQUEST record.
pub fn encode_end_request(
    request_id: u16,
    app_status: u32,
    protocol_status: ProtocolStatus,
) -> Vec<u8> {
    let mut content = [0u8; 8];
    content[..4].copy_from_slice(&app_status.to_be_bytes());
    content[4] = protocol_status as u8;
    encode(RecordType::EndRequest, request_id, &content)
        .expect("end-request content is fixed size")
}

/// Encodes a PARAMS record from name/value pairs. An empty slice makes
/// the header-terminating empty record.
pub fn encode_params(request_id: u16, params: &[(&str, &str)]) -> crate::Result<Vec<u8>> {
    let mut content = Vec::new();
    for (name, value) in params {
        encode_param_len(&mut content, name.len());
        encode_param_len(&mut content, value.len());
        content.extend_from_slice(name.as_bytes());
        content.extend_from_slice(value.as_bytes());
    }
    encode(RecordType::Params, request_id, &content)
}

fn encode_param_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

/// Encodes a STDIN record. Empty data ends the request body.
pub fn encode_stdin(request_id: u16, data: &[u8]) -> crate::Result<Vec<u8>> {
    encode(RecordType::Stdin, request_id, data)
}

/// Encodes a STDOUT record. Empty data ends the response body.
pub fn encode_stdout(request_id: u16, data: &[u8]) -> crate::Result<Vec<u8>> {
    encode(RecordType::Stdout, request_id, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_request_round_trip() {
        let wire = encode_begin_request(1, ROLE_RESPONDER, FLAG_KEEP_CONN);
        let (record, consumed) = parse_one(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(
            record,
            Record::BeginRequest {
                request_id: 1,
                role: ROLE_RESPONDER,
                flags: FLAG_KEEP_CONN,
            }
        );
    }

    #[test]
    fn stdin_round_trip_with_padding() {
        let wire = encode_stdin(7, b"hello").unwrap();
        // 5 content bytes round up to the next multiple of 8
        assert_eq!(wire.len(), 8 + 5 + 3);
        assert_eq!((wire.len() - 8) % 8, 0);
        let (record, consumed) = parse_one(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        match record {
            Record::Stdin { request_id, data } => {
                assert_eq!(request_id, 7);
                assert_eq!(&data[..], b"hello");
            }
            other => panic!("wrong record: {:?}", other),
        }
    }

    #[test]
    fn records_parse_back_to_back() {
        let mut wire = encode_stdin(1, b"first").unwrap();
        wire.extend_from_slice(&encode_stdin(1, b"").unwrap());
        let (first, consumed) = parse_one(&wire).unwrap();
        assert!(matches!(first, Record::Stdin { ref data, .. } if &data[..] == b"first"));
        let (second, rest_consumed) = parse_one(&wire[consumed..]).unwrap();
        assert!(matches!(second, Record::Stdin { ref data, .. } if data.is_empty()));
        assert_eq!(consumed + rest_consumed, wire.len());
    }

    #[test]
    fn exhausted_until_whole_record_arrives() {
        let wire = encode_stdin(1, b"stuff").unwrap();
        for cut in 0..wire.len() {
            assert_eq!(
                parse_one(&wire[..cut]).unwrap_err(),
                ParseError::BufferExhausted,
                "cut at {}",
                cut
            );
        }
        assert!(parse_one(&wire).is_ok());
    }

    #[test]
    fn params_round_trip() {
        let pairs: &[(&str, &str)] = &[
            ("REQUEST_METHOD", "POST"),
            ("HTTP_HOST", "example.org"),
            ("EMPTY", ""),
        ];
        let wire = encode_params(9, pairs).unwrap();
        let (record, _) = parse_one(&wire).unwrap();
        match record {
            Record::Params { request_id, params } => {
                assert_eq!(request_id, 9);
                assert_eq!(params.len(), 3);
                assert_eq!(params[0], ("REQUEST_METHOD".to_owned(), "POST".to_owned()));
                assert_eq!(params[2].1, "");
            }
            other => panic!("wrong record: {:?}", other),
        }
    }

    #[test]
    fn long_param_uses_four_byte_length() {
        let long_value = "v".repeat(300);
        let pairs: &[(&str, &str)] = &[("NAME", &long_value)];
        let wire = encode_params(1, pairs).unwrap();
        // name_len (1) + value_len (4) + name + value
        let content_len = u16::from_be_bytes([wire[4], wire[5]]) as usize;
        assert_eq!(content_len, 1 + 4 + 4 + 300);
        let (record, _) = parse_one(&wire).unwrap();
        match record {
            Record::Params { params, .. } => assert_eq!(params[0].1, long_value),
            other => panic!("wrong record: {:?}", other),
        }
    }

    #[test]
    fn short_param_uses_one_byte_length() {
        let value = "v".repeat(127);
        let wire = encode_params(1, &[("N", &value)]).unwrap();
        let content_len = u16::from_be_bytes([wire[4], wire[5]]) as usize;
        assert_eq!(content_len, 1 + 1 + 1 + 127);
    }

    #[test]
    fn wrong_version_rejected() {
        let mut wire = encode_stdin(1, b"x").unwrap();
        wire[0] = 9;
        assert_eq!(parse_one(&wire).unwrap_err(), ParseError::InvalidVersion);
    }

    #[test]
    fn unknown_type_rejected() {
        let mut wire = encode_stdin(1, b"x").unwrap();
        wire[1] = 11; // GET_VALUES, unsupported
        assert_eq!(parse_one(&wire).unwrap_err(), ParseError::InvalidType);
    }

    #[test]
    fn authorizer_role_rejected_with_id() {
        let mut content = [0u8; 8];
        content[..2].copy_from_slice(&2u16.to_be_bytes());
        let wire = encode(RecordType::BeginRequest, 5, &content).unwrap();
        assert_eq!(
            parse_one(&wire).unwrap_err(),
            ParseError::UnsupportedRole { request_id: 5 }
        );
    }

    #[test]
    fn end_request_round_trip() {
        let wire = encode_end_request(3, 0, ProtocolStatus::CantMpxConn);
        let (record, _) = parse_one(&wire).unwrap();
        assert_eq!(
            record,
            Record::EndRequest {
                request_id: 3,
                app_status: 0,
                protocol_status: ProtocolStatus::CantMpxConn as u8,
            }
        );
    }

    #[test]
    fn oversize_content_refused() {
        let big = vec![0u8; MAX_CONTENT_LEN + 1];
        assert!(encode_stdout(1, &big).is_err());
    }
}
