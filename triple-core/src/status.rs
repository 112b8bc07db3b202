use std::fmt;

use http::header::HeaderMap;
use http::HeaderValue;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Trailer carrying the numeric status code.
pub const GRPC_STATUS: &str = "grpc-status";
/// Trailer carrying the optional human-readable status message.
pub const GRPC_MESSAGE: &str = "grpc-message";

/// Characters that must be escaped in a `grpc-message` trailer value.
///
/// The wire form allows the printable ASCII range except `%` itself;
/// everything else (controls, non-ASCII UTF-8 bytes) is percent-encoded.
const GRPC_MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%').add(0x7f);

/// Status codes of a finished call, numerically aligned with gRPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Map a wire value to a code. Values outside the defined set decode
    /// as `Unknown` rather than failing the call.
    pub fn from_i32(value: i32) -> Code {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn value(self) -> i32 {
        self as i32
    }

    /// HTTP status used when a unary method is invoked over plain HTTP/JSON.
    pub fn http_status(self) -> u16 {
        match self {
            Code::Ok => 200,
            Code::InvalidArgument => 400,
            Code::Unauthenticated => 401,
            Code::PermissionDenied => 403,
            Code::NotFound => 404,
            Code::Unavailable => 503,
            Code::DeadlineExceeded => 504,
            _ => 500,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "Cancelled",
            Code::Unknown => "Unknown",
            Code::InvalidArgument => "InvalidArgument",
            Code::DeadlineExceeded => "DeadlineExceeded",
            Code::NotFound => "NotFound",
            Code::AlreadyExists => "AlreadyExists",
            Code::PermissionDenied => "PermissionDenied",
            Code::ResourceExhausted => "ResourceExhausted",
            Code::FailedPrecondition => "FailedPrecondition",
            Code::Aborted => "Aborted",
            Code::OutOfRange => "OutOfRange",
            Code::Unimplemented => "Unimplemented",
            Code::Internal => "Internal",
            Code::Unavailable => "Unavailable",
            Code::DataLoss => "DataLoss",
            Code::Unauthenticated => "Unauthenticated",
        };
        f.write_str(name)
    }
}

/// Terminal status of a call: code, message, and optional opaque details.
///
/// A call observes exactly one terminal status. The message travels in the
/// `grpc-message` trailer, percent-encoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    code: Code,
    message: String,
    details: Vec<u8>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn ok() -> Status {
        Status::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Status {
        Status::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Status {
        Status::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Status {
        Status::new(Code::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Status {
        Status::new(Code::PermissionDenied, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Status {
        Status::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Status {
        Status::new(Code::Unavailable, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Status {
        Status::new(Code::Unauthenticated, message)
    }

    pub fn with_details(mut self, details: Vec<u8>) -> Status {
        self.details = details;
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &[u8] {
        &self.details
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Render the status as response trailers.
    ///
    /// `grpc-status` is always present; `grpc-message` only when non-empty.
    pub fn to_trailers(&self) -> HeaderMap {
        let mut trailers = HeaderMap::with_capacity(2);
        trailers.insert(
            GRPC_STATUS,
            HeaderValue::from_str(&self.code.value().to_string())
                .expect("numeric status is a valid header value"),
        );
        if !self.message.is_empty() {
            let encoded = utf8_percent_encode(&self.message, GRPC_MESSAGE_ESCAPES).to_string();
            if let Ok(value) = HeaderValue::from_str(&encoded) {
                trailers.insert(GRPC_MESSAGE, value);
            }
        }
        trailers
    }

    /// Read a status out of a trailer (or trailers-only header) block.
    ///
    /// Returns `None` when no `grpc-status` is present; a non-numeric
    /// `grpc-status` decodes as `Unknown`. The message is percent-decoded;
    /// malformed escapes pass through verbatim.
    pub fn from_trailers(trailers: &HeaderMap) -> Option<Status> {
        let raw = trailers.get(GRPC_STATUS)?;
        let code = raw
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .map(Code::from_i32)
            .unwrap_or(Code::Unknown);
        let message = trailers
            .get(GRPC_MESSAGE)
            .and_then(|v| v.to_str().ok())
            .map(decode_grpc_message)
            .unwrap_or_default();
        Some(Status::new(code, message))
    }

    /// Synthesize a status for a response whose HTTP `:status` is not 200,
    /// following the standard gRPC HTTP-to-status mapping.
    pub fn from_http_status(http: u16) -> Status {
        let code = match http {
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            429 | 502 | 503 | 504 => Code::Unavailable,
            _ => Code::Unknown,
        };
        Status::new(code, format!("unexpected HTTP status {http}"))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{} ({})", self.code, self.code.value())
        } else {
            write!(f, "{} ({}): {}", self.code, self.code.value(), self.message)
        }
    }
}

fn decode_grpc_message(raw: &str) -> String {
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_wire_value() {
        for value in 0..=16 {
            assert_eq!(Code::from_i32(value).value(), value);
        }
    }

    #[test]
    fn unknown_numeric_code_decodes_as_unknown() {
        assert_eq!(Code::from_i32(42), Code::Unknown);
        assert_eq!(Code::from_i32(-1), Code::Unknown);
    }

    #[test]
    fn trailers_round_trip() {
        let status = Status::internal("boom");
        let trailers = status.to_trailers();
        let parsed = Status::from_trailers(&trailers).expect("status present");
        assert_eq!(parsed.code(), Code::Internal);
        assert_eq!(parsed.message(), "boom");
    }

    #[test]
    fn message_percent_encodes_non_ascii() {
        let status = Status::unknown("héllo wörld");
        let trailers = status.to_trailers();
        let raw = trailers[GRPC_MESSAGE].to_str().unwrap();
        assert!(raw.contains('%'));
        let parsed = Status::from_trailers(&trailers).unwrap();
        assert_eq!(parsed.message(), "héllo wörld");
    }

    #[test]
    fn empty_message_omits_trailer() {
        let trailers = Status::ok().to_trailers();
        assert!(trailers.get(GRPC_MESSAGE).is_none());
        assert_eq!(trailers[GRPC_STATUS], "0");
    }

    #[test]
    fn missing_status_trailer_is_none() {
        let trailers = HeaderMap::new();
        assert!(Status::from_trailers(&trailers).is_none());
    }

    #[test]
    fn malformed_escape_passes_through() {
        let mut trailers = HeaderMap::new();
        trailers.insert(GRPC_STATUS, HeaderValue::from_static("2"));
        trailers.insert(GRPC_MESSAGE, HeaderValue::from_static("bad%zzescape"));
        let parsed = Status::from_trailers(&trailers).unwrap();
        assert_eq!(parsed.message(), "bad%zzescape");
    }

    #[test]
    fn http_mapping_for_json_calls() {
        assert_eq!(Code::Ok.http_status(), 200);
        assert_eq!(Code::InvalidArgument.http_status(), 400);
        assert_eq!(Code::Unauthenticated.http_status(), 401);
        assert_eq!(Code::PermissionDenied.http_status(), 403);
        assert_eq!(Code::NotFound.http_status(), 404);
        assert_eq!(Code::Unavailable.http_status(), 503);
        assert_eq!(Code::DeadlineExceeded.http_status(), 504);
        assert_eq!(Code::Internal.http_status(), 500);
        assert_eq!(Code::Aborted.http_status(), 500);
    }
}
