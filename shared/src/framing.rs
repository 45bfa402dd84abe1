//! Recovers discrete application packets from a TCP byte stream.
//!
//! A single read may carry zero, one or many packets, and one packet may be
//! split across any number of reads. The buffer keeps partial packets until
//! the rest arrives.

use crate::{DEFAULT_MAX_TCP_PACKET_SIZE, HEADER_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use log::{debug, warn};

/// Per-connection decode buffer. Owned by exactly one connection.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops the next complete packet payload, if one is fully buffered.
    ///
    /// A non-positive length header means nothing further can be read and
    /// discards everything buffered. So does a header larger than the
    /// configured maximum, which keeps a forged length from growing the
    /// buffer without bound.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < HEADER_SIZE {
            return None;
        }

        let len = (&self.buf[..HEADER_SIZE]).get_i32_le();
        if len <= 0 {
            debug!(
                "Non-positive frame length {}, discarding {} buffered bytes",
                len,
                self.buf.len()
            );
            self.buf.clear();
            return None;
        }

        let len = len as usize;
        if len > self.max_frame_len {
            warn!(
                "Frame length {} exceeds maximum {}, discarding buffer",
                len, self.max_frame_len
            );
            self.buf.clear();
            return None;
        }

        if self.buf.len() - HEADER_SIZE < len {
            return None;
        }

        self.buf.advance(HEADER_SIZE);
        Some(self.buf.split_to(len).freeze())
    }

    /// Feeds a chunk and hands every completed payload to `on_frame`.
    pub fn decode(&mut self, chunk: &[u8], mut on_frame: impl FnMut(Bytes)) -> usize {
        self.extend(chunk);
        let mut count = 0;
        while let Some(frame) = self.next_frame() {
            on_frame(frame);
            count += 1;
        }
        count
    }

    /// Bytes held back waiting for the rest of a packet.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TCP_PACKET_SIZE)
    }
}
