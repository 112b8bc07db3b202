//! Caller-facing stream halves.
//!
//! A call binds a push-style producer ([`MessageSink`]) and a pull-style
//! consumer ([`MessageSource`]) to one HTTP/2 stream. Both are backed by
//! bounded queues: a full outbound queue blocks the producing thread
//! (the backpressure point), and the consumer blocks until a message,
//! trailers, or cancellation is observable.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::codec::MessageCodec;
use crate::context::CallShared;
use crate::error::{Result, TripleError};
use crate::framing::encode_frame;
use crate::status::Status;

/// Untyped producer half handed to the router for erased dispatch.
pub(crate) struct RawSink {
    pub(crate) tx: mpsc::Sender<Bytes>,
    pub(crate) shared: Arc<CallShared>,
    pub(crate) max_message_size: usize,
}

/// Untyped consumer half handed to the router for erased dispatch.
pub(crate) struct RawSource {
    pub(crate) rx: mpsc::Receiver<Bytes>,
    pub(crate) shared: Arc<CallShared>,
}

/// Push producer for one direction of a stream.
///
/// `close` half-closes the outbound direction and is idempotent;
/// `send` after `close` fails with `IllegalState`.
pub struct MessageSink<T> {
    tx: Option<mpsc::Sender<Bytes>>,
    codec: MessageCodec<T>,
    shared: Arc<CallShared>,
    max_message_size: usize,
}

impl<T> MessageSink<T> {
    pub(crate) fn new(
        tx: mpsc::Sender<Bytes>,
        codec: MessageCodec<T>,
        shared: Arc<CallShared>,
        max_message_size: usize,
    ) -> MessageSink<T> {
        MessageSink {
            tx: Some(tx),
            codec,
            shared,
            max_message_size,
        }
    }

    pub(crate) fn from_raw(raw: RawSink, codec: MessageCodec<T>) -> MessageSink<T> {
        let max = raw.max_message_size;
        MessageSink::new(raw.tx, codec, raw.shared, max)
    }

    /// Serialize, frame, and enqueue one message, blocking while the
    /// outbound queue is full.
    pub fn send(&mut self, value: &T) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TripleError::IllegalState("send after outbound half-close".into()))?;
        if self.shared.cancel.is_cancelled() {
            return Err(self.shared.terminal_error());
        }
        let payload = self.codec.serialize(value)?;
        if payload.len() > self.max_message_size {
            return Err(TripleError::InvalidArgument(format!(
                "message of {} bytes exceeds the {}-byte limit",
                payload.len(),
                self.max_message_size
            )));
        }
        tx.blocking_send(encode_frame(&payload, false))
            .map_err(|_| self.shared.terminal_error())
    }

    /// Close the outbound half. Further sends fail; repeated closes are
    /// no-ops.
    pub fn close(&mut self) {
        self.tx.take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    /// Cancel the whole call. Idempotent.
    pub fn cancel(&self) {
        self.shared
            .fail(Status::cancelled("call cancelled"), Some(h2::Reason::CANCEL));
    }
}

/// Pull consumer for one direction of a stream.
///
/// Iteration ends with `None` after OK trailers; a non-OK terminal
/// status is yielded once as an `Err` item before the end.
pub struct MessageSource<T> {
    rx: mpsc::Receiver<Bytes>,
    codec: MessageCodec<T>,
    shared: Arc<CallShared>,
    finished: bool,
    /// Client response streams cancel the call when dropped undrained;
    /// a server handler dropping its request stream early is routine.
    cancel_on_drop: bool,
}

impl<T> MessageSource<T> {
    pub(crate) fn new(
        rx: mpsc::Receiver<Bytes>,
        codec: MessageCodec<T>,
        shared: Arc<CallShared>,
    ) -> MessageSource<T> {
        MessageSource {
            rx,
            codec,
            shared,
            finished: false,
            cancel_on_drop: true,
        }
    }

    pub(crate) fn from_raw(raw: RawSource, codec: MessageCodec<T>) -> MessageSource<T> {
        let mut source = MessageSource::new(raw.rx, codec, raw.shared);
        source.cancel_on_drop = false;
        source
    }

    /// Terminal status, once the call has one.
    pub fn status(&self) -> Option<Status> {
        self.shared.status.get().cloned()
    }

    /// Cancel the whole call. Idempotent; after this no further message
    /// is delivered.
    pub fn cancel(&self) {
        self.shared
            .fail(Status::cancelled("call cancelled"), Some(h2::Reason::CANCEL));
    }

    fn terminal_item(&mut self) -> Option<Result<T>> {
        self.finished = true;
        match self.shared.status.get() {
            Some(status) if status.is_ok() => None,
            Some(status) => Some(Err(TripleError::from(status.clone()))),
            // No terminal status yet: a clean half-close of the inbound
            // direction (the server-side view of the request stream).
            None if self.shared.inbound_done() => None,
            None => Some(Err(TripleError::Transport(
                "stream terminated without a status".into(),
            ))),
        }
    }
}

impl<T> Iterator for MessageSource<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.finished {
            return None;
        }
        // Once cancellation fired, queued messages are no longer
        // user-visible.
        if self.shared.cancel.is_cancelled() {
            self.rx.close();
            return self.terminal_item();
        }
        match self.rx.blocking_recv() {
            Some(payload) => match self.codec.deserialize(payload) {
                Ok(value) => Some(Ok(value)),
                Err(err) => {
                    self.shared
                        .fail(err.status(), Some(h2::Reason::PROTOCOL_ERROR));
                    self.finished = true;
                    Some(Err(err))
                }
            },
            None => self.terminal_item(),
        }
    }
}

impl<T> Drop for MessageSource<T> {
    fn drop(&mut self) {
        // Dropping an undrained consumer is an implicit cancel; a
        // completed call keeps its terminal status.
        if self.cancel_on_drop && !self.finished && self.shared.status.get().is_none() {
            self.shared.fail(
                Status::cancelled("response consumer dropped"),
                Some(h2::Reason::CANCEL),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::DEFAULT_MAX_MESSAGE_SIZE;
    use crate::status::Code;

    fn json_codec() -> MessageCodec<String> {
        MessageCodec::json()
    }

    fn sink_with_capacity(cap: usize) -> (MessageSink<String>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(cap);
        let shared = CallShared::new();
        (
            MessageSink::new(tx, json_codec(), shared, DEFAULT_MAX_MESSAGE_SIZE),
            rx,
        )
    }

    #[test]
    fn send_frames_the_payload() {
        let (mut sink, mut rx) = sink_with_capacity(4);
        sink.send(&"hi".to_string()).unwrap();
        let frame = rx.blocking_recv().unwrap();
        assert_eq!(&frame[..5], &[0, 0, 0, 0, 4]);
        assert_eq!(&frame[5..], br#""hi""#);
    }

    #[test]
    fn double_close_is_a_no_op() {
        let (mut sink, _rx) = sink_with_capacity(1);
        sink.close();
        sink.close();
        assert!(sink.is_closed());
    }

    #[test]
    fn send_after_close_is_illegal_state() {
        let (mut sink, _rx) = sink_with_capacity(1);
        sink.close();
        let err = sink.send(&"late".to_string()).unwrap_err();
        assert!(matches!(err, TripleError::IllegalState(_)));
    }

    #[test]
    fn send_after_cancel_reports_cancelled() {
        let (mut sink, _rx) = sink_with_capacity(1);
        sink.cancel();
        let err = sink.send(&"x".to_string()).unwrap_err();
        assert!(matches!(err, TripleError::Cancelled));
    }

    #[test]
    fn oversized_message_is_rejected_locally() {
        let (tx, _rx) = mpsc::channel(1);
        let mut sink = MessageSink::new(tx, json_codec(), CallShared::new(), 8);
        let err = sink.send(&"far too large".to_string()).unwrap_err();
        assert!(matches!(err, TripleError::InvalidArgument(_)));
    }

    #[test]
    fn source_ends_cleanly_after_ok_status() {
        let (tx, rx) = mpsc::channel(4);
        let shared = CallShared::new();
        let mut source = MessageSource::new(rx, json_codec(), Arc::clone(&shared));
        tx.blocking_send(Bytes::from_static(br#""one""#)).unwrap();
        shared.complete(Status::ok());
        drop(tx);
        assert_eq!(source.next().unwrap().unwrap(), "one");
        assert!(source.next().is_none());
        assert!(source.next().is_none());
    }

    #[test]
    fn source_yields_terminal_error_once() {
        let (tx, rx) = mpsc::channel(4);
        let shared = CallShared::new();
        let mut source = MessageSource::<String>::new(rx, json_codec(), Arc::clone(&shared));
        shared.complete(Status::internal("boom"));
        drop(tx);
        let err = source.next().unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(source.next().is_none());
    }

    #[test]
    fn cancellation_suppresses_queued_messages() {
        let (tx, rx) = mpsc::channel(4);
        let shared = CallShared::new();
        let mut source = MessageSource::<String>::new(rx, json_codec(), Arc::clone(&shared));
        tx.blocking_send(Bytes::from_static(br#""queued""#)).unwrap();
        shared.fail(Status::cancelled("stop"), Some(h2::Reason::CANCEL));
        let err = source.next().unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert!(source.next().is_none());
    }
}
