//! The call engine: per-call state machines mapping the four call
//! patterns onto HTTP/2 streams.

pub(crate) mod client;
pub(crate) mod server;

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Result, TripleError};

/// Content type of Triple/gRPC requests, without the codec suffix.
pub(crate) const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Content type that selects the plain HTTP/JSON unary path.
pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";

/// Split the codec name out of a `application/grpc+<codec>` content type.
/// A bare `application/grpc` means protobuf.
pub(crate) fn codec_name_of(content_type: &str) -> Option<&str> {
    let rest = content_type.strip_prefix(GRPC_CONTENT_TYPE)?;
    match rest.as_bytes().first() {
        None => Some("proto"),
        Some(b'+') => Some(&rest[1..]),
        _ => None,
    }
}

/// Validate caller-supplied metadata into HTTP/2 headers. Reserved names
/// (pseudo-headers and protocol headers) are rejected rather than
/// silently dropped.
pub(crate) fn metadata_to_headers(metadata: &[(String, String)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(metadata.len());
    for (name, value) in metadata {
        let lowered = name.to_ascii_lowercase();
        if lowered.starts_with(':')
            || matches!(
                lowered.as_str(),
                "content-type" | "te" | "grpc-timeout" | "grpc-status" | "grpc-message"
            )
        {
            return Err(TripleError::MalformedHeaders(format!(
                "metadata name {name:?} is reserved"
            )));
        }
        let header_name = HeaderName::from_bytes(lowered.as_bytes()).map_err(|_| {
            TripleError::MalformedHeaders(format!("invalid metadata name {name:?}"))
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            TripleError::MalformedHeaders(format!("invalid metadata value for {name:?}"))
        })?;
        headers.append(header_name, header_value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_name_parsing() {
        assert_eq!(codec_name_of("application/grpc+proto"), Some("proto"));
        assert_eq!(codec_name_of("application/grpc+json"), Some("json"));
        assert_eq!(codec_name_of("application/grpc"), Some("proto"));
        assert_eq!(codec_name_of("application/grpcweb"), None);
        assert_eq!(codec_name_of("text/plain"), None);
    }

    #[test]
    fn metadata_rejects_reserved_names() {
        assert!(metadata_to_headers(&[(":path".into(), "/x".into())]).is_err());
        assert!(metadata_to_headers(&[("grpc-timeout".into(), "1S".into())]).is_err());
        assert!(metadata_to_headers(&[("Content-Type".into(), "x".into())]).is_err());
    }

    #[test]
    fn metadata_lowercases_names() {
        let headers = metadata_to_headers(&[("X-Trace-Id".into(), "abc".into())]).unwrap();
        assert_eq!(headers.get("x-trace-id").unwrap(), "abc");
    }
}
