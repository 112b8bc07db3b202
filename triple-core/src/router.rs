//! Server-side dispatch: exact `:path` match onto registered handlers.
//!
//! Typed handlers are erased to a byte-level form at registration time;
//! the call pattern is recorded as a tagged variant so the engine can
//! enforce the right streaming shape without ever inspecting message
//! types.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::MessageCodec;
use crate::context::ServerContext;
use crate::descriptor::{CallPattern, MethodDescriptor};
use crate::status::Status;
use crate::stream::{MessageSink, MessageSource, RawSink, RawSource};

pub(crate) type UnaryFn =
    dyn Fn(&ServerContext, Bytes) -> Result<Bytes, Status> + Send + Sync;
pub(crate) type ClientStreamFn =
    dyn Fn(&ServerContext, RawSource) -> Result<Bytes, Status> + Send + Sync;
pub(crate) type ServerStreamFn =
    dyn Fn(&ServerContext, Bytes, RawSink) -> Result<(), Status> + Send + Sync;
pub(crate) type BidiStreamFn =
    dyn Fn(&ServerContext, RawSource, RawSink) -> Result<(), Status> + Send + Sync;

/// A registered handler; the variant pins the invocation shape.
#[derive(Clone)]
pub(crate) enum MethodHandler {
    Unary(Arc<UnaryFn>),
    ClientStream(Arc<ClientStreamFn>),
    ServerStream(Arc<ServerStreamFn>),
    BidiStream(Arc<BidiStreamFn>),
}

impl MethodHandler {
    pub(crate) fn pattern(&self) -> CallPattern {
        match self {
            MethodHandler::Unary(_) => CallPattern::Unary,
            MethodHandler::ClientStream(_) => CallPattern::ClientStream,
            MethodHandler::ServerStream(_) => CallPattern::ServerStream,
            MethodHandler::BidiStream(_) => CallPattern::BidiStream,
        }
    }
}

/// One routable method: its handler plus the codec name expected in the
/// request content-type.
#[derive(Clone)]
pub(crate) struct Route {
    pub(crate) codec_name: String,
    pub(crate) handler: MethodHandler,
}

/// Exact-match path router.
#[derive(Clone, Default)]
pub(crate) struct Router {
    routes: HashMap<String, Route>,
}

impl Router {
    pub(crate) fn new() -> Router {
        Router::default()
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    pub(crate) fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    fn insert(&mut self, path: String, codec_name: String, handler: MethodHandler) {
        self.routes.insert(path, Route { codec_name, handler });
    }

    /// Register a unary handler: one request in, one response out.
    pub(crate) fn add_unary<Req, Resp, F>(&mut self, method: &MethodDescriptor<Req, Resp>, f: F)
    where
        F: Fn(&ServerContext, Req) -> Result<Resp, Status> + Send + Sync + 'static,
        Req: 'static,
        Resp: 'static,
    {
        let request_codec = method.request_codec().clone();
        let response_codec = method.response_codec().clone();
        let erased = move |ctx: &ServerContext, payload: Bytes| -> Result<Bytes, Status> {
            let request = decode_request(&request_codec, payload)?;
            let response = f(ctx, request)?;
            encode_response(&response_codec, &response)
        };
        self.insert(
            method.path(),
            method.codec_name().to_string(),
            MethodHandler::Unary(Arc::new(erased)),
        );
    }

    /// Register a client-streaming handler: a request iterator in, one
    /// response out.
    pub(crate) fn add_client_stream<Req, Resp, F>(
        &mut self,
        method: &MethodDescriptor<Req, Resp>,
        f: F,
    ) where
        F: Fn(&ServerContext, MessageSource<Req>) -> Result<Resp, Status> + Send + Sync + 'static,
        Req: 'static,
        Resp: 'static,
    {
        let request_codec = method.request_codec().clone();
        let response_codec = method.response_codec().clone();
        let erased = move |ctx: &ServerContext, raw: RawSource| -> Result<Bytes, Status> {
            let requests = MessageSource::from_raw(raw, request_codec.clone());
            let response = f(ctx, requests)?;
            encode_response(&response_codec, &response)
        };
        self.insert(
            method.path(),
            method.codec_name().to_string(),
            MethodHandler::ClientStream(Arc::new(erased)),
        );
    }

    /// Register a server-streaming handler: one request in, a response
    /// writer out.
    pub(crate) fn add_server_stream<Req, Resp, F>(
        &mut self,
        method: &MethodDescriptor<Req, Resp>,
        f: F,
    ) where
        F: Fn(&ServerContext, Req, &mut MessageSink<Resp>) -> Result<(), Status>
            + Send
            + Sync
            + 'static,
        Req: 'static,
        Resp: 'static,
    {
        let request_codec = method.request_codec().clone();
        let response_codec = method.response_codec().clone();
        let erased = move |ctx: &ServerContext, payload: Bytes, raw: RawSink| -> Result<(), Status> {
            let request = decode_request(&request_codec, payload)?;
            let mut responses = MessageSink::from_raw(raw, response_codec.clone());
            let result = f(ctx, request, &mut responses);
            responses.close();
            result
        };
        self.insert(
            method.path(),
            method.codec_name().to_string(),
            MethodHandler::ServerStream(Arc::new(erased)),
        );
    }

    /// Register a bidirectional handler: both halves stream and close
    /// independently.
    pub(crate) fn add_bidi_stream<Req, Resp, F>(
        &mut self,
        method: &MethodDescriptor<Req, Resp>,
        f: F,
    ) where
        F: Fn(&ServerContext, MessageSource<Req>, &mut MessageSink<Resp>) -> Result<(), Status>
            + Send
            + Sync
            + 'static,
        Req: 'static,
        Resp: 'static,
    {
        let request_codec = method.request_codec().clone();
        let response_codec = method.response_codec().clone();
        let erased =
            move |ctx: &ServerContext, raw_rx: RawSource, raw_tx: RawSink| -> Result<(), Status> {
                let requests = MessageSource::from_raw(raw_rx, request_codec.clone());
                let mut responses = MessageSink::from_raw(raw_tx, response_codec.clone());
                let result = f(ctx, requests, &mut responses);
                responses.close();
                result
            };
        self.insert(
            method.path(),
            method.codec_name().to_string(),
            MethodHandler::BidiStream(Arc::new(erased)),
        );
    }
}

fn decode_request<Req>(codec: &MessageCodec<Req>, payload: Bytes) -> Result<Req, Status> {
    codec
        .deserialize(payload)
        .map_err(|e| Status::internal(format!("failed to decode request: {e}")))
}

fn encode_response<Resp>(codec: &MessageCodec<Resp>, response: &Resp) -> Result<Bytes, Status> {
    codec
        .serialize(response)
        .map_err(|e| Status::internal(format!("failed to encode response: {e}")))
}
