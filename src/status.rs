//! HTTP status codes

use std::fmt;

/// An HTTP status code (`status-code` in RFC 7230 et al.).
///
/// Covers the codes this engine recognizes by name. `Unknown` is the
/// "no status yet" sentinel; its numeric form is `-1`. Codes a peer
/// sends that are not in this set are carried numerically by the client
/// response alongside an `Unknown` here.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StatusCode {
    /// No status has been assigned yet.
    Unknown,
    /// 100 Continue
    Continue,
    /// 101 Switching Protocols
    SwitchingProtocols,
    /// 102 Processing
    Processing,
    /// 200 OK
    Ok,
    /// 201 Created
    Created,
    /// 202 Accepted
    Accepted,
    /// 203 Non-Authoritative Information
    NonAuthoritativeInformation,
    /// 204 No Content
    NoContent,
    /// 205 Reset Content
    ResetContent,
    /// 206 Partial Content
    PartialContent,
    /// 207 Multi-Status
    MultiStatus,
    /// 300 Multiple Choices
    MultipleChoices,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 302 Found (moved temporarily)
    MovedTemporarily,
    /// 303 See Other
    SeeOther,
    /// 304 Not Modified
    NotModified,
    /// 305 Use Proxy
    UseProxy,
    /// 307 Temporary Redirect
    TemporaryRedirect,
    /// 400 Bad Request
    BadRequest,
    /// 401 Unauthorized
    Unauthorized,
    /// 402 Payment Required
    PaymentRequired,
    /// 403 Forbidden
    Forbidden,
    /// 404 Not Found
    NotFound,
    /// 405 Method Not Allowed
    MethodNotAllowed,
    /// 406 Not Acceptable
    NotAcceptable,
    /// 407 Proxy Authentication Required
    ProxyAuthenticationRequired,
    /// 408 Request Timeout
    RequestTimeout,
    /// 409 Conflict
    Conflict,
    /// 410 Gone
    Gone,
    /// 411 Length Required
    LengthRequired,
    /// 412 Precondition Failed
    PreconditionFailed,
    /// 413 Request Entity Too Large
    RequestEntityTooLarge,
    /// 414 Request-URI Too Long
    RequestUriTooLong,
    /// 415 Unsupported Media Type
    UnsupportedMediaType,
    /// 416 Requested Range Not Satisfiable
    RequestedRangeNotSatisfiable,
    /// 417 Expectation Failed
    ExpectationFailed,
    /// 419 Insufficient Space On Resource
    InsufficientSpaceOnResource,
    /// 420 Method Failure
    MethodFailure,
    /// 422 Unprocessable Entity
    UnprocessableEntity,
    /// 424 Failed Dependency
    FailedDependency,
    /// 428 Precondition Required
    PreconditionRequired,
    /// 429 Too Many Requests
    TooManyRequests,
    /// 431 Request Header Fields Too Large
    RequestHeaderFieldsTooLarge,
    /// 500 Internal Server Error
    InternalServerError,
    /// 501 Not Implemented
    NotImplemented,
    /// 502 Bad Gateway
    BadGateway,
    /// 503 Service Unavailable
    ServiceUnavailable,
    /// 504 Gateway Timeout
    GatewayTimeout,
    /// 505 HTTP Version Not Supported
    HttpVersionNotSupported,
    /// 507 Insufficient Storage
    InsufficientStorage,
    /// 511 Network Authentication Required
    NetworkAuthenticationRequired,
}

impl StatusCode {
    /// Looks up a code by number; unrecognized numbers yield `Unknown`.
    pub fn from_u16(code: u16) -> StatusCode {
        use self::StatusCode::*;
        match code {
            100 => Continue,
            101 => SwitchingProtocols,
            102 => Processing,
            200 => Ok,
            201 => Created,
            202 => Accepted,
            203 => NonAuthoritativeInformation,
            204 => NoContent,
            205 => ResetContent,
            206 => PartialContent,
            207 => MultiStatus,
            300 => MultipleChoices,
            301 => MovedPermanently,
            302 => MovedTemporarily,
            303 => SeeOther,
            304 => NotModified,
            305 => UseProxy,
            307 => TemporaryRedirect,
            400 => BadRequest,
            401 => Unauthorized,
            402 => PaymentRequired,
            403 => Forbidden,
            404 => NotFound,
            405 => MethodNotAllowed,
            406 => NotAcceptable,
            407 => ProxyAuthenticationRequired,
            408 => RequestTimeout,
            409 => Conflict,
            410 => Gone,
            411 => LengthRequired,
            412 => PreconditionFailed,
            413 => RequestEntityTooLarge,
            414 => RequestUriTooLong,
            415 => UnsupportedMediaType,
            416 => RequestedRangeNotSatisfiable,
            417 => ExpectationFailed,
            419 => InsufficientSpaceOnResource,
            420 => MethodFailure,
            422 => UnprocessableEntity,
            424 => FailedDependency,
            428 => PreconditionRequired,
            429 => TooManyRequests,
            431 => RequestHeaderFieldsTooLarge,
            500 => InternalServerError,
            501 => NotImplemented,
            502 => BadGateway,
            503 => ServiceUnavailable,
            504 => GatewayTimeout,
            505 => HttpVersionNotSupported,
            507 => InsufficientStorage,
            511 => NetworkAuthenticationRequired,
            _ => Unknown,
        }
    }

    /// The numeric code, or `-1` for `Unknown`.
    pub fn as_i32(&self) -> i32 {
        use self::StatusCode::*;
        match *self {
            Unknown => -1,
            Continue => 100,
            SwitchingProtocols => 101,
            Processing => 102,
            Ok => 200,
            Created => 201,
            Accepted => 202,
            NonAuthoritativeInformation => 203,
            NoContent => 204,
            ResetContent => 205,
            PartialContent => 206,
            MultiStatus => 207,
            MultipleChoices => 300,
            MovedPermanently => 301,
            MovedTemporarily => 302,
            SeeOther => 303,
            NotModified => 304,
            UseProxy => 305,
            TemporaryRedirect => 307,
            BadRequest => 400,
            Unauthorized => 401,
            PaymentRequired => 402,
            Forbidden => 403,
            NotFound => 404,
            MethodNotAllowed => 405,
            NotAcceptable => 406,
            ProxyAuthenticationRequired => 407,
            RequestTimeout => 408,
            Conflict => 409,
            Gone => 410,
            LengthRequired => 411,
            PreconditionFailed => 412,
            RequestEntityTooLarge => 413,
            RequestUriTooLong => 414,
            UnsupportedMediaType => 415,
            RequestedRangeNotSatisfiable => 416,
            ExpectationFailed => 417,
            InsufficientSpaceOnResource => 419,
            MethodFailure => 420,
            UnprocessableEntity => 422,
            FailedDependency => 424,
            PreconditionRequired => 428,
            TooManyRequests => 429,
            RequestHeaderFieldsTooLarge => 431,
            InternalServerError => 500,
            NotImplemented => 501,
            BadGateway => 502,
            ServiceUnavailable => 503,
            GatewayTimeout => 504,
            HttpVersionNotSupported => 505,
            InsufficientStorage => 507,
            NetworkAuthenticationRequired => 511,
        }
    }

    /// The numeric code as `u16`; `Unknown` has none.
    pub fn as_u16(&self) -> Option<u16> {
        let code = self.as_i32();
        if code < 0 {
            None
        } else {
            Some(code as u16)
        }
    }

    /// The canonical reason phrase, e.g. `Ok` → `"OK"`.
    pub fn canonical_reason(&self) -> &'static str {
        use self::StatusCode::*;
        match *self {
            Unknown => "Unknown",
            Continue => "Continue",
            SwitchingProtocols => "Switching Protocols",
            Processing => "Processing",
            Ok => "OK",
            Created => "Created",
            Accepted => "Accepted",
            NonAuthoritativeInformation => "Non-Authoritative Information",
            NoContent => "No Content",
            ResetContent => "Reset Content",
            PartialContent => "Partial Content",
            MultiStatus => "Multi-Status",
            MultipleChoices => "Multiple Choices",
            MovedPermanently => "Moved Permanently",
            MovedTemporarily => "Found",
            SeeOther => "See Other",
            NotModified => "Not Modified",
            UseProxy => "Use Proxy",
            TemporaryRedirect => "Temporary Redirect",
            BadRequest => "Bad Request",
            Unauthorized => "Unauthorized",
            PaymentRequired => "Payment Required",
            Forbidden => "Forbidden",
            NotFound => "Not Found",
            MethodNotAllowed => "Method Not Allowed",
            NotAcceptable => "Not Acceptable",
            ProxyAuthenticationRequired => "Proxy Authentication Required",
            RequestTimeout => "Request Timeout",
            Conflict => "Conflict",
            Gone => "Gone",
            LengthRequired => "Length Required",
            PreconditionFailed => "Precondition Failed",
            RequestEntityTooLarge => "Request Entity Too Large",
            RequestUriTooLong => "Request-URI Too Long",
            UnsupportedMediaType => "Unsupported Media Type",
            RequestedRangeNotSatisfiable => "Requested Range Not Satisfiable",
            ExpectationFailed => "Expectation Failed",
            InsufficientSpaceOnResource => "Insufficient Space On Resource",
            MethodFailure => "Method Failure",
            UnprocessableEntity => "Unprocessable Entity",
            FailedDependency => "Failed Dependency",
            PreconditionRequired => "Precondition Required",
            TooManyRequests => "Too Many Requests",
            RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            InternalServerError => "Internal Server Error",
            NotImplemented => "Not Implemented",
            BadGateway => "Bad Gateway",
            ServiceUnavailable => "Service Unavailable",
            GatewayTimeout => "Gateway Timeout",
            HttpVersionNotSupported => "HTTP Version Not Supported",
            InsufficientStorage => "Insufficient Storage",
            NetworkAuthenticationRequired => "Network Authentication Required",
        }
    }

    /// Whether the code is 1xx.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.as_i32())
    }

    /// Whether the code is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.as_i32())
    }

    /// Whether the code is 3xx.
    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.as_i32())
    }

    /// Whether the code is 4xx.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.as_i32())
    }

    /// Whether the code is 5xx.
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.as_i32())
    }
}

impl Default for StatusCode {
    fn default() -> StatusCode {
        StatusCode::Unknown
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_i32(), self.canonical_reason())
    }
}
