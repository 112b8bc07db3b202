use std::fmt;

use crate::status::{Code, Status};

/// All error kinds produced by the runtime.
///
/// Domain errors are distinct from wire status codes: every variant knows
/// how to surface itself as a [`Status`], but only `Rpc` carries a status
/// that actually crossed the wire.
#[derive(Debug)]
pub enum TripleError {
    /// A length-prefixed message frame violated the framing rules
    /// (oversized declared length, reserved flag bits, trailing bytes).
    MalformedFrame(String),

    /// Required request or response headers were missing or unparseable.
    MalformedHeaders(String),

    /// The peer ended the stream without a well-formed status block.
    MalformedTrailers(String),

    /// A user-supplied serializer or deserializer failed.
    Codec(String),

    /// Connection-level failure: dial error, connection reset, GOAWAY.
    Transport(String),

    /// The call deadline fired before a terminal status was observed.
    Timeout,

    /// The call was cancelled by the caller or the peer.
    Cancelled,

    /// The directory had no usable endpoint for the service.
    NoAvailableProvider(String),

    /// API misuse, raised locally and never sent on the wire
    /// (e.g. `send` after the outbound half was closed).
    IllegalState(String),

    /// An invalid argument was provided (malformed URL, bad header name).
    InvalidArgument(String),

    /// The call terminated with a non-OK status.
    Rpc(Status),
}

impl TripleError {
    /// The status this error surfaces as, per the propagation policy:
    /// protocol violations and codec failures are `Internal`, transport
    /// and provider failures are `Unavailable`, deadline is
    /// `DeadlineExceeded`, and `Rpc` is passed through.
    pub fn status(&self) -> Status {
        match self {
            TripleError::MalformedFrame(msg)
            | TripleError::MalformedHeaders(msg)
            | TripleError::MalformedTrailers(msg)
            | TripleError::Codec(msg)
            | TripleError::IllegalState(msg) => Status::internal(msg.clone()),
            TripleError::Transport(msg) => Status::unavailable(msg.clone()),
            TripleError::Timeout => Status::deadline_exceeded("deadline exceeded"),
            TripleError::Cancelled => Status::cancelled("call cancelled"),
            TripleError::NoAvailableProvider(service) => {
                Status::unavailable(format!("no available provider for {service}"))
            }
            TripleError::InvalidArgument(msg) => Status::invalid_argument(msg.clone()),
            TripleError::Rpc(status) => status.clone(),
        }
    }

    /// The status code this error surfaces as.
    pub fn code(&self) -> Code {
        match self {
            TripleError::Rpc(status) => status.code(),
            TripleError::Timeout => Code::DeadlineExceeded,
            TripleError::Cancelled => Code::Cancelled,
            TripleError::Transport(_) | TripleError::NoAvailableProvider(_) => Code::Unavailable,
            TripleError::InvalidArgument(_) => Code::InvalidArgument,
            _ => Code::Internal,
        }
    }
}

impl fmt::Display for TripleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripleError::MalformedFrame(msg) => write!(f, "malformed frame: {msg}"),
            TripleError::MalformedHeaders(msg) => write!(f, "malformed headers: {msg}"),
            TripleError::MalformedTrailers(msg) => write!(f, "malformed trailers: {msg}"),
            TripleError::Codec(msg) => write!(f, "codec error: {msg}"),
            TripleError::Transport(msg) => write!(f, "transport error: {msg}"),
            TripleError::Timeout => write!(f, "deadline exceeded"),
            TripleError::Cancelled => write!(f, "call cancelled"),
            TripleError::NoAvailableProvider(service) => {
                write!(f, "no available provider for {service}")
            }
            TripleError::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            TripleError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            TripleError::Rpc(status) => write!(f, "rpc failed: {status}"),
        }
    }
}

impl std::error::Error for TripleError {}

impl From<Status> for TripleError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::Cancelled => TripleError::Cancelled,
            _ => TripleError::Rpc(status),
        }
    }
}

impl From<std::io::Error> for TripleError {
    fn from(err: std::io::Error) -> Self {
        TripleError::Transport(err.to_string())
    }
}

impl From<h2::Error> for TripleError {
    fn from(err: h2::Error) -> Self {
        if let Some(reason) = err.reason() {
            match reason {
                h2::Reason::CANCEL => TripleError::Cancelled,
                h2::Reason::PROTOCOL_ERROR | h2::Reason::INTERNAL_ERROR => {
                    TripleError::Rpc(Status::internal(format!("stream reset: {err}")))
                }
                _ => TripleError::Transport(format!("stream reset: {err}")),
            }
        } else {
            TripleError::Transport(err.to_string())
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TripleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violations_surface_internal() {
        assert_eq!(TripleError::MalformedFrame("x".into()).code(), Code::Internal);
        assert_eq!(TripleError::Codec("x".into()).code(), Code::Internal);
        assert_eq!(TripleError::IllegalState("x".into()).code(), Code::Internal);
    }

    #[test]
    fn transport_failures_surface_unavailable() {
        assert_eq!(TripleError::Transport("x".into()).code(), Code::Unavailable);
        assert_eq!(
            TripleError::NoAvailableProvider("svc".into()).code(),
            Code::Unavailable
        );
    }

    #[test]
    fn timeout_surfaces_deadline_exceeded() {
        assert_eq!(TripleError::Timeout.code(), Code::DeadlineExceeded);
        assert_eq!(
            TripleError::Timeout.status().code(),
            Code::DeadlineExceeded
        );
    }

    #[test]
    fn rpc_status_passes_through() {
        let err = TripleError::Rpc(Status::not_found("nothing here"));
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.status().message(), "nothing here");
    }

    #[test]
    fn peer_cancel_maps_to_cancelled() {
        let err = TripleError::from(Status::cancelled("peer went away"));
        assert!(matches!(err, TripleError::Cancelled));
    }
}
