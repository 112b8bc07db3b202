//! Client half of the call engine.
//!
//! `start_call` opens the HTTP/2 stream and installs two loop tasks: a
//! send task draining the caller's bounded outbound queue onto the
//! stream, and a receive task decoding frames into the bounded inbound
//! queue. The caller-facing [`MessageSink`]/[`MessageSource`] pair talks
//! only to those queues, so caller threads never touch session state.

use std::sync::Arc;

use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use h2::{Reason, SendStream};
use http::{HeaderMap, Method, Request, Uri, Version};
use tokio::sync::mpsc;
use tracing::debug;

use crate::call::metadata_to_headers;
use crate::codec::MessageCodec;
use crate::config::ClientConfig;
use crate::context::{CallOptions, CallShared};
use crate::deadline::{encode_grpc_timeout, Deadline, GRPC_TIMEOUT};
use crate::descriptor::CallPattern;
use crate::endpoint::Endpoint;
use crate::error::{Result, TripleError};
use crate::framing::FrameDecoder;
use crate::status::Status;
use crate::stream::{MessageSink, MessageSource};
use crate::transport::{close_outbound, write_frame};

/// Everything the engine needs to open one stream, independent of the
/// request and response message types.
pub(crate) struct CallSetup {
    pub(crate) path: String,
    pub(crate) content_type: String,
    pub(crate) pattern: CallPattern,
    pub(crate) endpoint: Endpoint,
    pub(crate) deadline: Option<Deadline>,
    pub(crate) metadata: HeaderMap,
}

impl CallSetup {
    pub(crate) fn new<Req, Resp>(
        method: &crate::descriptor::MethodDescriptor<Req, Resp>,
        endpoint: Endpoint,
        options: &CallOptions,
        config: &ClientConfig,
    ) -> Result<CallSetup> {
        let timeout = options.timeout.or(config.timeout);
        Ok(CallSetup {
            path: method.path(),
            content_type: method.content_type(),
            pattern: method.pattern(),
            endpoint,
            deadline: timeout.map(Deadline::after),
            metadata: metadata_to_headers(&options.metadata)?,
        })
    }

    fn build_request(&self, user_agent: &str) -> Result<Request<()>> {
        let uri: Uri = format!("http://{}{}", self.endpoint.addr(), self.path)
            .parse()
            .map_err(|e| TripleError::MalformedHeaders(format!("invalid request URI: {e}")))?;
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .version(Version::HTTP_2)
            .header(http::header::CONTENT_TYPE, self.content_type.as_str())
            .header(http::header::TE, "trailers")
            .header(http::header::USER_AGENT, user_agent);
        if let Some(deadline) = self.deadline {
            builder = builder.header(GRPC_TIMEOUT, encode_grpc_timeout(deadline.remaining()));
        }
        let mut request = builder
            .body(())
            .map_err(|e| TripleError::MalformedHeaders(e.to_string()))?;
        request.headers_mut().extend(self.metadata.clone());
        Ok(request)
    }
}

/// Open the stream and start its loop tasks. Returns the frame-level
/// queue endpoints; `start_call` wraps them in typed halves.
async fn open_stream(
    mut send_request: SendRequest<Bytes>,
    setup: CallSetup,
    config: &ClientConfig,
    shared: Arc<CallShared>,
) -> Result<(mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>)> {
    let request = setup.build_request(&config.user_agent)?;
    let (response, send_stream) = send_request
        .send_request(request, false)
        .map_err(|e| TripleError::Transport(format!("failed to open stream: {e}")))?;

    let (out_tx, out_rx) = mpsc::channel::<Bytes>(config.queue_capacity);
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(config.queue_capacity);

    tokio::spawn(drive_send(send_stream, out_rx, Arc::clone(&shared)));
    tokio::spawn(drive_recv(
        response,
        in_tx,
        Arc::clone(&shared),
        setup.deadline,
        config.max_message_size,
        setup.pattern.single_response(),
    ));
    Ok((out_tx, in_rx))
}

/// Start a call on the current client. Runs on the caller thread; the
/// async work is shipped to the event loop.
pub(crate) fn start_call<Req, Resp>(
    driver: &crate::runtime::Driver,
    pool: Arc<crate::transport::client::ConnectionPool>,
    setup: CallSetup,
    request_codec: MessageCodec<Req>,
    response_codec: MessageCodec<Resp>,
    config: &ClientConfig,
) -> Result<(MessageSink<Req>, MessageSource<Resp>, Arc<CallShared>)> {
    let shared = CallShared::new();
    let task_shared = Arc::clone(&shared);
    let task_config = config.clone();
    let endpoint = setup.endpoint.clone();
    let (out_tx, in_rx) = driver.run(async move {
        let send_request = pool.checkout(&endpoint).await?;
        open_stream(send_request, setup, &task_config, task_shared).await
    })??;
    let sink = MessageSink::new(
        out_tx,
        request_codec,
        Arc::clone(&shared),
        config.max_message_size,
    );
    let source = MessageSource::new(in_rx, response_codec, Arc::clone(&shared));
    Ok((sink, source, shared))
}

/// Drain the outbound queue onto the stream; close the outbound half
/// exactly once when the queue closes; reset on cancellation.
async fn drive_send(
    mut stream: SendStream<Bytes>,
    mut out_rx: mpsc::Receiver<Bytes>,
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
            // A failed write always has an inbound counterpart (reset,
            // trailers, or connection loss); let the receive task settle
            // the status instead of racing it with a send-side guess.
            debug!(%err, "send path ended early");
            return;
        }
    };
    if cancelled {
        stream.send_reset(shared.reset_reason().unwrap_or(Reason::CANCEL));
        return;
    }
    close_outbound(&mut stream);
    // Keep the reset path alive until the call finishes so a late
    // cancellation still reaches the peer.
    let late_cancel = tokio::select! {
        _ = shared.finished.cancelled() => false,
        _ = shared.cancel.cancelled() => true,
    };
    if late_cancel {
        stream.send_reset(shared.reset_reason().unwrap_or(Reason::CANCEL));
    }
}

/// Receive headers, frames, and trailers; feed the inbound queue; settle
/// the status slot exactly once.
async fn drive_recv(
    response: ResponseFuture,
    in_tx: mpsc::Sender<Bytes>,
    shared: Arc<CallShared>,
    deadline: Option<Deadline>,
    max_message_size: usize,
    single_response: bool,
) {
    let receive = recv_loop(response, &in_tx, &shared, max_message_size, single_response);
    let outcome = match deadline {
        Some(deadline) => {
            tokio::select! {
                _ = tokio::time::sleep(deadline.remaining()) => Err(TripleError::Timeout),
                _ = shared.cancel.cancelled() => Err(shared.terminal_error()),
                result = receive => result,
            }
        }
        None => {
            tokio::select! {
                _ = shared.cancel.cancelled() => Err(shared.terminal_error()),
                result = receive => result,
            }
        }
    };
    match outcome {
        Ok(status) => shared.complete(status),
        Err(TripleError::Timeout) => {
            debug!("call deadline fired");
            shared.fail(Status::deadline_exceeded("deadline exceeded"), Some(Reason::CANCEL));
        }
        Err(err) => {
            let reset = match err {
                TripleError::MalformedFrame(_)
                | TripleError::MalformedHeaders(_)
                | TripleError::MalformedTrailers(_) => Some(Reason::PROTOCOL_ERROR),
                _ => None,
            };
            shared.fail(err.status(), reset);
        }
    }
    shared.finish();
    // in_tx drops here, ending consumer iteration.
}

async fn recv_loop(
    response: ResponseFuture,
    in_tx: &mpsc::Sender<Bytes>,
    shared: &Arc<CallShared>,
    max_message_size: usize,
    single_response: bool,
) -> Result<Status> {
    let response = response.await?;
    if response.status() != http::StatusCode::OK {
        return Err(TripleError::Rpc(Status::from_http_status(
            response.status().as_u16(),
        )));
    }
    shared.store_response_headers(response.headers().clone());

    // Trailers-only response: the terminal status rides on the initial
    // HEADERS frame and no messages follow.
    if let Some(status) = Status::from_trailers(response.headers()) {
        shared.store_response_trailers(response.headers().clone());
        return Ok(status);
    }

    let mut body = response.into_body();
    let mut flow = body.flow_control().clone();
    let mut decoder = FrameDecoder::new(max_message_size);
    let mut received = 0usize;

    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        decoder.push(&chunk);
        while let Some(frame) = decoder.next_frame()? {
            if frame.compressed {
                return Err(TripleError::Rpc(Status::unimplemented(
                    "compressed responses are not supported",
                )));
            }
            received += 1;
            if single_response && received > 1 {
                let status = Status::internal("more than one response message on a unary call");
                shared.fail(status.clone(), Some(Reason::INTERNAL_ERROR));
                return Err(TripleError::Rpc(status));
            }
            if in_tx.send(frame.payload).await.is_err() {
                // Consumer went away; its drop already cancelled the call.
                return Err(shared.terminal_error());
            }
        }
        // Window credit goes back only once the chunk is enqueued, so a
        // fast sender cannot outrun the bounded inbound queue.
        let _ = flow.release_capacity(chunk.len());
    }
    if !decoder.is_empty() {
        return Err(TripleError::MalformedFrame(
            "stream ended inside a message frame".into(),
        ));
    }

    match body.trailers().await? {
        Some(trailers) => {
            shared.store_response_trailers(trailers.clone());
            match Status::from_trailers(&trailers) {
                Some(status) => Ok(status),
                None => Ok(Status::unknown("trailers missing grpc-status")),
            }
        }
        None => Ok(Status::unknown("stream ended without trailers")),
    }
}
