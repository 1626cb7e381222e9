//! Device wire frames.
//!
//! Wire format (all integers little-endian):
//!
//! ```text
//! [4 bytes] header   (device terminal id)
//! [2 bytes] command  (see `Command`)
//! [2 bytes] payload length
//! [N bytes] payload
//! ```
//!
//! A device socket may deliver half a frame or several frames in one read,
//! so [`FrameBuffer`] accumulates bytes and hands out complete frames one at
//! a time.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 8;

/// Default upper bound on a single frame payload (16 KiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024;

/// The wire length field is a u16, so nothing larger can ever be framed.
const WIRE_MAX_PAYLOAD: usize = u16::MAX as usize;

/// One discrete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Device terminal id. Replies echo the request's header.
    pub header: u32,
    /// Raw command code.
    pub command: u16,
    /// Payload bytes (`payload_len()` of them).
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: u32, command: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            command,
            payload: payload.into(),
        }
    }

    /// Build the reply to this frame: same header, same command code.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self::new(self.header, self.command, payload)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Encode this frame to wire bytes.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        encode(self.header, self.command, &self.payload)
    }
}

/// Errors raised by the frame codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The declared (or supplied) payload exceeds the allowed maximum.
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Result of a single decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of buffer bytes it occupied.
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds less than one complete frame. Nothing was consumed.
    NeedMoreData,
}

/// Parse the fixed header, returning `(header, command, payload_len)`.
fn parse_header(buf: &[u8], max_payload: usize) -> Result<Option<(u32, u16, usize)>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let header = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let command = u16::from_le_bytes([buf[4], buf[5]]);
    let len = u16::from_le_bytes([buf[6], buf[7]]) as usize;

    if len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            len,
            max: max_payload,
        });
    }

    Ok(Some((header, command, len)))
}

/// Decode one frame from the front of `buf`.
///
/// Never consumes a partial frame: on [`Decoded::NeedMoreData`] the caller
/// keeps the whole buffer for the next read. Unknown command codes decode
/// normally; classifying them is the dispatcher's job.
pub fn decode(buf: &[u8], max_payload: usize) -> Result<Decoded, FrameError> {
    let Some((header, command, len)) = parse_header(buf, max_payload)? else {
        return Ok(Decoded::NeedMoreData);
    };

    let total = HEADER_LEN + len;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreData);
    }

    Ok(Decoded::Frame {
        frame: Frame::new(header, command, Bytes::copy_from_slice(&buf[HEADER_LEN..total])),
        consumed: total,
    })
}

/// Encode a frame to wire bytes.
pub fn encode(header: u32, command: u16, payload: &[u8]) -> Result<Bytes, FrameError> {
    let len = u16::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        len: payload.len(),
        max: WIRE_MAX_PAYLOAD,
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(header);
    buf.put_u16_le(command);
    buf.put_u16_le(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental reassembly buffer for one connection's inbound byte stream.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_payload: usize,
    /// Bytes of a rejected frame still to be dropped as they arrive.
    discard_remaining: usize,
}

impl FrameBuffer {
    /// Create a buffer that rejects payloads above `max_payload` bytes.
    ///
    /// The limit is clamped to what the u16 length field can express.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(HEADER_LEN + 512),
            max_payload: max_payload.min(WIRE_MAX_PAYLOAD),
            discard_remaining: 0,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for `AsyncReadExt::read_buf`.
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next complete frame, if any.
    ///
    /// A frame whose declared payload exceeds the limit is reported once as
    /// an error and then skipped byte for byte, including payload bytes that
    /// have not arrived yet. Decoding resumes at the next frame boundary.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if !self.skip_discarded() {
            return Ok(None);
        }

        let (header, command, len) = match parse_header(&self.buf, self.max_payload) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(None),
            Err(e) => {
                let FrameError::PayloadTooLarge { len, .. } = e;
                self.discard_remaining = HEADER_LEN + len;
                self.skip_discarded();
                return Err(e);
            }
        };

        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame::new(header, command, payload)))
    }

    /// True while the buffer is in the middle of skipping a rejected frame.
    pub fn is_discarding(&self) -> bool {
        self.discard_remaining > 0
    }

    /// Drop buffered bytes owed to a rejected frame. Returns true once
    /// nothing is left to skip.
    fn skip_discarded(&mut self) -> bool {
        let n = self.discard_remaining.min(self.buf.len());
        self.buf.advance(n);
        self.discard_remaining -= n;
        self.discard_remaining == 0
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}
