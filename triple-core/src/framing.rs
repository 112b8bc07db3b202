//! Length-prefixed message framing.
//!
//! Triple frames are identical to gRPC frames: a one-byte compressed flag,
//! a four-byte big-endian payload length, then the payload itself. The
//! decoder is incremental and tolerates arbitrary chunking of its input.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TripleError};

/// Size of the flag + length prefix.
pub const FRAME_HEADER_LEN: usize = 5;

/// Default cap on a single decoded payload (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// One decoded length-prefixed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub compressed: bool,
    pub payload: Bytes,
}

/// Frame a payload for the wire.
pub fn encode_frame(payload: &[u8], compressed: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(compressed as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental frame decoder.
///
/// Feed raw bytes with [`push`](FrameDecoder::push) in whatever chunks the
/// transport delivers, then drain complete frames with
/// [`next_frame`](FrameDecoder::next_frame) until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> FrameDecoder {
        FrameDecoder {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the next complete frame, if the buffer holds one.
    ///
    /// Fails when the declared length exceeds the configured maximum or
    /// the flag byte uses reserved bits.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let flag = self.buf[0];
        if flag > 1 {
            return Err(TripleError::MalformedFrame(format!(
                "reserved compressed-flag value {flag}"
            )));
        }
        let declared = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        let len = declared as usize;
        if len > self.max_message_size {
            return Err(TripleError::MalformedFrame(format!(
                "declared length {len} exceeds maximum message size {}",
                self.max_message_size
            )));
        }
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame {
            compressed: flag == 1,
            payload,
        }))
    }

    /// True when no partial frame is buffered. A non-empty decoder at end
    /// of stream means the peer truncated a frame.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().expect("well-formed input") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encode_prefixes_flag_and_length() {
        let frame = encode_frame(b"abc", false);
        assert_eq!(&frame[..], &[0, 0, 0, 0, 3, b'a', b'b', b'c']);
        let frame = encode_frame(b"", true);
        assert_eq!(&frame[..], &[1, 0, 0, 0, 0]);
    }

    #[test]
    fn round_trips_single_frame() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&encode_frame(b"hello", false));
        let frames = decode_all(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].compressed);
        assert_eq!(&frames[0].payload[..], b"hello");
        assert!(decoder.is_empty());
    }

    #[test]
    fn zero_length_payload_frames_correctly() {
        let encoded = encode_frame(b"", false);
        assert_eq!(encoded.len(), FRAME_HEADER_LEN);
        let mut decoder = FrameDecoder::default();
        decoder.push(&encoded);
        let frames = decode_all(&mut decoder);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn tolerates_arbitrary_chunking() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode_frame(b"first", false));
        wire.extend_from_slice(&encode_frame(b"second", true));
        wire.extend_from_slice(&encode_frame(&[0u8; 300], false));

        // Feed one byte at a time.
        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            decoder.push(std::slice::from_ref(byte));
            frames.extend(decode_all(&mut decoder));
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0].payload[..], b"first");
        assert_eq!(&frames[1].payload[..], b"second");
        assert!(frames[1].compressed);
        assert_eq!(frames[2].payload.len(), 300);
        assert!(decoder.is_empty());
    }

    #[test]
    fn payload_at_cap_succeeds_one_past_fails() {
        let cap = 64;
        let mut decoder = FrameDecoder::new(cap);
        decoder.push(&encode_frame(&vec![7u8; cap], false));
        let frame = decoder.next_frame().unwrap().expect("complete frame");
        assert_eq!(frame.payload.len(), cap);

        let mut decoder = FrameDecoder::new(cap);
        decoder.push(&encode_frame(&vec![7u8; cap + 1], false));
        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, TripleError::MalformedFrame(_)));
    }

    #[test]
    fn oversized_length_fails_before_payload_arrives() {
        // Only the prefix is needed to reject an oversized declaration.
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&[0, 0xff, 0xff, 0xff, 0xff]);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn reserved_flag_bits_fail() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&[2, 0, 0, 0, 0]);
        assert!(matches!(
            decoder.next_frame(),
            Err(TripleError::MalformedFrame(_))
        ));
    }

    #[test]
    fn partial_frame_reports_not_empty() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&[0, 0, 0, 0, 5, b'x']);
        assert!(decoder.next_frame().unwrap().is_none());
        assert!(!decoder.is_empty());
    }
}
