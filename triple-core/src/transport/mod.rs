//! HTTP/2 transport: connection ownership and stream I/O primitives.
//!
//! Connections are driven exclusively by the event loop. The helpers here
//! are the flow-control-aware write path shared by the client and server
//! halves of the call engine.

pub(crate) mod client;
pub(crate) mod server;

use std::future::poll_fn;

use bytes::Bytes;
use h2::SendStream;

use crate::error::{Result, TripleError};

/// Write one frame, suspending whenever the stream's flow-control window
/// is exhausted and resuming on WINDOW_UPDATE.
pub(crate) async fn write_frame(
    stream: &mut SendStream<Bytes>,
    mut frame: Bytes,
    end_of_stream: bool,
) -> Result<()> {
    if frame.is_empty() {
        stream.send_data(frame, end_of_stream)?;
        return Ok(());
    }
    while !frame.is_empty() {
        stream.reserve_capacity(frame.len());
        let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(result) => result?,
            None => {
                return Err(TripleError::Transport(
                    "stream closed while waiting for send capacity".into(),
                ))
            }
        };
        if granted == 0 {
            continue;
        }
        let chunk = frame.split_to(granted.min(frame.len()));
        let last = frame.is_empty();
        stream.send_data(chunk, end_of_stream && last)?;
    }
    Ok(())
}

/// Half-close the outbound direction with an empty DATA frame.
pub(crate) fn close_outbound(stream: &mut SendStream<Bytes>) {
    let _ = stream.send_data(Bytes::new(), true);
}
