//! Server half of the call engine.
//!
//! Each accepted HTTP/2 stream becomes one loop task: it parses the
//! request head, pumps inbound frames into a bounded queue, dispatches
//! the registered handler onto the blocking pool, and drains the
//! handler's bounded outbound queue back onto the stream, finishing with
//! trailers or a reset.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use h2::server::SendResponse;
use h2::{Reason, RecvStream, SendStream};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::call::{codec_name_of, GRPC_CONTENT_TYPE, JSON_CONTENT_TYPE};
use crate::config::ServerConfig;
use crate::context::{CallShared, ServerContext};
use crate::deadline::{decode_grpc_timeout, Deadline, GRPC_TIMEOUT};
use crate::error::TripleError;
use crate::framing::{encode_frame, FrameDecoder};
use crate::router::{MethodHandler, Route, Router};
use crate::status::Status;
use crate::stream::{RawSink, RawSource};
use crate::transport::write_frame;

/// Entry point for one accepted stream.
pub(crate) async fn serve_stream(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    router: Arc<Router>,
    config: Arc<ServerConfig>,
    peer: Option<SocketAddr>,
) {
    let path = request.uri().path().to_string();
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if content_type == JSON_CONTENT_TYPE
        || content_type.starts_with("application/json;")
    {
        serve_json(request, respond, &router, &config, peer, &path).await;
        return;
    }

    let Some(codec_name) = codec_name_of(&content_type) else {
        let mut response = Response::new(());
        *response.status_mut() = StatusCode::UNSUPPORTED_MEDIA_TYPE;
        let _ = respond.send_response(response, true);
        return;
    };

    let Some(route) = router.lookup(&path).cloned() else {
        debug!(%path, "no handler registered");
        let status = Status::unimplemented(format!("unknown method {path}"));
        let _ = respond.send_response(trailers_only(&status), true);
        return;
    };
    if route.codec_name != codec_name {
        let status = Status::unimplemented(format!(
            "method {path} expects codec {:?}, got {codec_name:?}",
            route.codec_name
        ));
        let _ = respond.send_response(trailers_only(&status), true);
        return;
    }

    serve_grpc(request, respond, route, config, peer).await;
}

/// Trailers-only response: the whole outcome rides on one HEADERS frame.
fn trailers_only(status: &Status) -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    response.headers_mut().extend(status.to_trailers());
    response
}

/// Request metadata visible to handlers: everything except the protocol
/// headers consumed by the engine.
fn handler_metadata(headers: &HeaderMap) -> HeaderMap {
    let mut metadata = headers.clone();
    metadata.remove(CONTENT_TYPE);
    metadata.remove(http::header::TE);
    metadata.remove(GRPC_TIMEOUT);
    metadata
}

async fn serve_grpc(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    route: Route,
    config: Arc<ServerConfig>,
    peer: Option<SocketAddr>,
) {
    let (parts, body) = request.into_parts();

    let deadline = match parts.headers.get(GRPC_TIMEOUT) {
        Some(raw) => match raw.to_str().ok().map(decode_grpc_timeout) {
            Some(Ok(timeout)) => Some(Deadline::after(timeout)),
            _ => {
                let status = Status::internal("malformed grpc-timeout header");
                let _ = respond.send_response(trailers_only(&status), true);
                return;
            }
        },
        None => None,
    };

    let shared = CallShared::new();
    let ctx = ServerContext::new(
        Arc::clone(&shared),
        handler_metadata(&parts.headers),
        deadline,
        peer,
    );

    let mut response = Response::new(());
    *response.status_mut() = StatusCode::OK;
    let grpc_content_type = format!("application/grpc+{}", route.codec_name);
    if let Ok(value) = HeaderValue::from_str(&grpc_content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    let send_stream = match respond.send_response(response, false) {
        Ok(stream) => stream,
        Err(err) => {
            debug!(%err, "failed to send response headers");
            return;
        }
    };

    if let Some(deadline) = deadline {
        let watcher = Arc::clone(&shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = watcher.finished.cancelled() => {}
                _ = tokio::time::sleep(deadline.remaining()) => {
                    debug!("server-side deadline fired");
                    watcher.fail(
                        Status::deadline_exceeded("deadline exceeded"),
                        Some(Reason::CANCEL),
                    );
                }
            }
        });
    }

    let (in_tx, in_rx) = mpsc::channel::<Bytes>(config.queue_capacity);
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(config.queue_capacity);
    let (status_tx, status_rx) = oneshot::channel::<Status>();

    let single_request = route.handler.pattern().single_request();
    tokio::spawn(pump_request_body(
        body,
        in_tx,
        Arc::clone(&shared),
        config.max_message_size,
        single_request,
    ));

    let dispatch = dispatch(
        route.handler,
        ctx,
        in_rx,
        out_tx,
        status_tx,
        Arc::clone(&shared),
        config.max_message_size,
    );
    let pump = pump_responses(send_stream, out_rx, status_rx, Arc::clone(&shared));
    tokio::join!(dispatch, pump);
    shared.finish();
}

/// Feed inbound DATA frames through the decoder into the handler's queue,
/// enforcing the call pattern's inbound shape.
async fn pump_request_body(
    mut body: RecvStream,
    in_tx: mpsc::Sender<Bytes>,
    shared: Arc<CallShared>,
    max_message_size: usize,
    single_request: bool,
) {
    let mut flow = body.flow_control().clone();
    let mut decoder = FrameDecoder::new(max_message_size);
    let mut received = 0usize;
    let outcome: Result<(), TripleError> = async {
        while let Some(chunk) = body.data().await {
            let chunk = chunk?;
            decoder.push(&chunk);
            while let Some(frame) = decoder.next_frame()? {
                if frame.compressed {
                    return Err(TripleError::Rpc(Status::unimplemented(
                        "compressed requests are not supported",
                    )));
                }
                received += 1;
                if single_request && received > 1 {
                    return Err(TripleError::MalformedFrame(
                        "second request message on a single-request method".into(),
                    ));
                }
                if in_tx.send(frame.payload).await.is_err() {
                    // Handler finished without draining; remaining input
                    // is irrelevant.
                    return Ok(());
                }
            }
            // Window credit goes back only once the chunk is enqueued, so
            // a fast sender cannot outrun the bounded inbound queue.
            let _ = flow.release_capacity(chunk.len());
        }
        if !decoder.is_empty() {
            return Err(TripleError::MalformedFrame(
                "request ended inside a message frame".into(),
            ));
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => shared.mark_inbound_done(),
        Err(TripleError::Cancelled) => {
            debug!("client reset the stream");
            shared.fail(Status::cancelled("client cancelled"), None);
        }
        Err(err @ TripleError::MalformedFrame(_)) => {
            shared.fail(err.status(), Some(Reason::PROTOCOL_ERROR));
        }
        Err(err) => {
            shared.fail(err.status(), None);
        }
    }
}

/// Drain handler output onto the stream; finish with trailers unless the
/// call was reset.
async fn pump_responses(
    mut stream: SendStream<Bytes>,
    mut out_rx: mpsc::Receiver<Bytes>,
    status_rx: oneshot::Receiver<Status>,
    shared: Arc<CallShared>,
) {
    let cancelled = loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break true,
            frame = out_rx.recv() => frame,
        };
        let Some(frame) = frame else { break false };
        let result = tokio::select! {
            _ = shared.cancel.cancelled() => break true,
            result = write_frame(&mut stream, frame, false) => result,
        };
        if let Err(err) = result {
            shared.fail(err.status(), None);
            return;
        }
    };
    if cancelled {
        match shared.reset_reason() {
            Some(reason) => stream.send_reset(reason),
            None => {
                // Failure carried in trailers rather than a reset.
                let status = shared
                    .status
                    .get()
                    .cloned()
                    .unwrap_or_else(|| Status::internal("call aborted"));
                let _ = stream.send_trailers(status.to_trailers());
            }
        }
        return;
    }
    let status = status_rx
        .await
        .unwrap_or_else(|_| Status::internal("handler finished without a status"));
    shared.complete(status.clone());
    let _ = stream.send_trailers(status.to_trailers());
}

/// Run the handler on the blocking pool in the shape its pattern pins.
async fn dispatch(
    handler: MethodHandler,
    ctx: ServerContext,
    mut in_rx: mpsc::Receiver<Bytes>,
    out_tx: mpsc::Sender<Bytes>,
    status_tx: oneshot::Sender<Status>,
    shared: Arc<CallShared>,
    max_message_size: usize,
) {
    let status = match handler {
        MethodHandler::Unary(f) => match in_rx.recv().await {
            Some(payload) => {
                let call_ctx = ctx.clone();
                match run_blocking(move || f(&call_ctx, payload)).await {
                    Ok(Ok(bytes)) => send_single_response(&out_tx, bytes, max_message_size).await,
                    Ok(Err(status)) => status,
                    Err(status) => status,
                }
            }
            None => missing_request_status(&shared),
        },
        MethodHandler::ClientStream(f) => {
            let raw = RawSource {
                rx: in_rx,
                shared: Arc::clone(&shared),
            };
            let call_ctx = ctx.clone();
            match run_blocking(move || f(&call_ctx, raw)).await {
                Ok(Ok(bytes)) => send_single_response(&out_tx, bytes, max_message_size).await,
                Ok(Err(status)) => status,
                Err(status) => status,
            }
        }
        MethodHandler::ServerStream(f) => match in_rx.recv().await {
            Some(payload) => {
                let raw = RawSink {
                    tx: out_tx.clone(),
                    shared: Arc::clone(&shared),
                    max_message_size,
                };
                let call_ctx = ctx.clone();
                match run_blocking(move || f(&call_ctx, payload, raw)).await {
                    Ok(Ok(())) => Status::ok(),
                    Ok(Err(status)) => status,
                    Err(status) => status,
                }
            }
            None => missing_request_status(&shared),
        },
        MethodHandler::BidiStream(f) => {
            let raw_rx = RawSource {
                rx: in_rx,
                shared: Arc::clone(&shared),
            };
            let raw_tx = RawSink {
                tx: out_tx.clone(),
                shared: Arc::clone(&shared),
                max_message_size,
            };
            let call_ctx = ctx.clone();
            match run_blocking(move || f(&call_ctx, raw_rx, raw_tx)).await {
                Ok(Ok(())) => Status::ok(),
                Ok(Err(status)) => status,
                Err(status) => status,
            }
        }
    };
    drop(out_tx);
    let _ = status_tx.send(status);
}

/// The inbound queue closed before the single expected request arrived:
/// either the call already failed (keep that status) or the client
/// half-closed an empty stream.
fn missing_request_status(shared: &Arc<CallShared>) -> Status {
    shared
        .status
        .get()
        .cloned()
        .unwrap_or_else(|| Status::internal("request stream ended without a message"))
}

async fn send_single_response(
    out_tx: &mpsc::Sender<Bytes>,
    payload: Bytes,
    max_message_size: usize,
) -> Status {
    if payload.len() > max_message_size {
        return Status::resource_exhausted(format!(
            "response of {} bytes exceeds the {max_message_size}-byte limit",
            payload.len()
        ));
    }
    let _ = out_tx.send(encode_frame(&payload, false)).await;
    Status::ok()
}

async fn run_blocking<T>(
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<T, Status>
where
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|err| {
        if err.is_panic() {
            warn!("handler panicked");
            Status::internal("handler panicked")
        } else {
            Status::cancelled("handler aborted")
        }
    })
}

/// Plain HTTP/JSON invocation of a unary method: one payload in the
/// request body, one payload in the response body, status mapped onto
/// HTTP codes.
async fn serve_json(
    request: Request<RecvStream>,
    respond: SendResponse<Bytes>,
    router: &Router,
    config: &ServerConfig,
    peer: Option<SocketAddr>,
    path: &str,
) {
    let handler = match router.lookup(path) {
        Some(route) => match &route.handler {
            MethodHandler::Unary(f) => Arc::clone(f),
            _ => {
                let status =
                    Status::unimplemented("only unary methods accept application/json");
                send_json_error(respond, &status);
                return;
            }
        },
        None => {
            let status = Status::unimplemented(format!("unknown method {path}"));
            send_json_error(respond, &status);
            return;
        }
    };

    let (parts, mut body) = request.into_parts();
    let mut flow = body.flow_control().clone();
    let mut payload = bytes::BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(_) => return,
        };
        let _ = flow.release_capacity(chunk.len());
        if payload.len() + chunk.len() > config.max_message_size {
            let status = Status::resource_exhausted(format!(
                "request body exceeds the {}-byte limit",
                config.max_message_size
            ));
            send_json_error(respond, &status);
            return;
        }
        payload.extend_from_slice(&chunk);
    }

    let shared = CallShared::new();
    let ctx = ServerContext::new(shared, handler_metadata(&parts.headers), None, peer);
    let payload = payload.freeze();
    let result = match run_blocking(move || handler(&ctx, payload)).await {
        Ok(result) => result,
        Err(status) => Err(status),
    };

    match result {
        Ok(bytes) => send_json_body(respond, StatusCode::OK, bytes),
        Err(status) => send_json_error(respond, &status),
    }
}

fn send_json_error(respond: SendResponse<Bytes>, status: &Status) {
    let http_status = StatusCode::from_u16(status.code().http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({
        "code": status.code().value(),
        "message": status.message(),
    });
    send_json_body(respond, http_status, Bytes::from(body.to_string()));
}

fn send_json_body(mut respond: SendResponse<Bytes>, http_status: StatusCode, body: Bytes) {
    let mut response = Response::new(());
    *response.status_mut() = http_status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
    match respond.send_response(response, body.is_empty()) {
        Ok(mut stream) => {
            if !body.is_empty() {
                let _ = stream.send_data(body, true);
            }
        }
        Err(err) => debug!(%err, "failed to send JSON response"),
    }
}
