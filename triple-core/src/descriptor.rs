use std::borrow::Cow;

use crate::codec::MessageCodec;

/// The four call shapes of the protocol. The variant pins the handler
/// signature the router expects and the half-close policy the call
/// engine applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPattern {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl CallPattern {
    /// Whether the inbound direction (requests on the server, responses on
    /// the client) carries exactly one message.
    pub fn single_request(self) -> bool {
        matches!(self, CallPattern::Unary | CallPattern::ServerStream)
    }

    pub fn single_response(self) -> bool {
        matches!(self, CallPattern::Unary | CallPattern::ClientStream)
    }
}

/// Immutable description of one remote operation: where it lives, its call
/// pattern, and how its request and response messages cross the codec
/// boundary.
#[derive(Debug, Clone)]
pub struct MethodDescriptor<Req, Resp> {
    service: Cow<'static, str>,
    method: Cow<'static, str>,
    pattern: CallPattern,
    request_codec: MessageCodec<Req>,
    response_codec: MessageCodec<Resp>,
    codec_name: Cow<'static, str>,
}

impl<Req, Resp> MethodDescriptor<Req, Resp> {
    pub fn new(
        service: impl Into<Cow<'static, str>>,
        method: impl Into<Cow<'static, str>>,
        pattern: CallPattern,
        request_codec: MessageCodec<Req>,
        response_codec: MessageCodec<Resp>,
        codec_name: impl Into<Cow<'static, str>>,
    ) -> MethodDescriptor<Req, Resp> {
        MethodDescriptor {
            service: service.into(),
            method: method.into(),
            pattern,
            request_codec,
            response_codec,
            codec_name: codec_name.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn pattern(&self) -> CallPattern {
        self.pattern
    }

    pub fn request_codec(&self) -> &MessageCodec<Req> {
        &self.request_codec
    }

    pub fn response_codec(&self) -> &MessageCodec<Resp> {
        &self.response_codec
    }

    /// Codec name carried in the content-type suffix ("proto", "json", ...).
    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    /// The HTTP/2 `:path` for this method.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    /// The request content-type, `application/grpc+<codec>`.
    pub fn content_type(&self) -> String {
        format!("application/grpc+{}", self.codec_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Echo {
        text: String,
    }

    fn echo_method() -> MethodDescriptor<Echo, Echo> {
        MethodDescriptor::new(
            "org.example.EchoService",
            "Echo",
            CallPattern::Unary,
            MessageCodec::json(),
            MessageCodec::json(),
            "json",
        )
    }

    #[test]
    fn path_joins_service_and_method() {
        assert_eq!(echo_method().path(), "/org.example.EchoService/Echo");
    }

    #[test]
    fn content_type_carries_codec_name() {
        assert_eq!(echo_method().content_type(), "application/grpc+json");
    }

    #[test]
    fn pattern_shapes() {
        assert!(CallPattern::Unary.single_request());
        assert!(CallPattern::Unary.single_response());
        assert!(CallPattern::ServerStream.single_request());
        assert!(!CallPattern::ServerStream.single_response());
        assert!(!CallPattern::ClientStream.single_request());
        assert!(CallPattern::ClientStream.single_response());
        assert!(!CallPattern::BidiStream.single_request());
        assert!(!CallPattern::BidiStream.single_response());
    }
}
