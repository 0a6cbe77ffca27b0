//! Frame decoding from a byte stream.
//!
//! Bytes arrive from a socket in arbitrary chunks. [`ChannelStream`] buffers
//! them and offers pop/unpop access; [`decode_frame`] pulls one message off
//! the front of the stream:
//!
//! ```text
//! first byte 0xAA  -> 64-byte unicast reply
//! anything else    -> 14 or 19 byte broadcast reply (layout from bytes 3..=4)
//! ```
//!
//! When not enough bytes are buffered the decoder returns
//! [`DecodeResult::Waiting`] and puts back everything it popped, so the next
//! attempt starts at the same stream position.

use bytes::{Buf, BytesMut};

use crate::constants::*;
use crate::error::ProtocolError;
use crate::layout::{render_version, BroadcastLayout};
use crate::messages::Message;

/// Outcome of one decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// Not enough bytes yet. Nothing was consumed.
    Waiting,
    /// A message was decoded and its bytes consumed.
    Success(Message),
    /// Bytes were consumed but produced no usable message.
    Ignore,
    /// Codec-internal fault. Malformed input never produces this.
    Error(ProtocolError),
}

/// Buffered byte stream with pop/unpop access.
#[derive(Debug, Default)]
pub struct ChannelStream {
    buffer: BytesMut,
}

impl ChannelStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        ChannelStream {
            buffer: BytesMut::with_capacity(FRAME_SIZE * 4),
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Move `count` bytes from the front of the stream onto `out`.
    ///
    /// Returns false, consuming nothing, if fewer than `count` bytes are buffered.
    pub fn pop(&mut self, count: usize, out: &mut Vec<u8>) -> bool {
        if self.buffer.len() < count {
            return false;
        }
        out.extend_from_slice(&self.buffer[..count]);
        self.buffer.advance(count);
        true
    }

    /// Put bytes back on the front of the stream.
    pub fn unpop(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut restored = BytesMut::with_capacity(data.len() + self.buffer.len());
        restored.extend_from_slice(data);
        restored.extend_from_slice(&self.buffer);
        self.buffer = restored;
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Decode one message from the front of `stream`.
pub fn decode_frame(stream: &mut ChannelStream) -> DecodeResult {
    let mut data = Vec::with_capacity(FRAME_SIZE);
    if !stream.pop(1, &mut data) {
        return DecodeResult::Waiting;
    }

    if data[0] == REPLY_MARKER {
        if !stream.pop(FRAME_SIZE - 1, &mut data) {
            stream.unpop(&data);
            return DecodeResult::Waiting;
        }
        let mut frame = [0u8; FRAME_SIZE];
        frame.copy_from_slice(&data);
        log::trace!("decoded reply frame, command 0x{:02X}", frame[OFFSET_COMMAND]);
        return DecodeResult::Success(Message::decode_reply(&frame));
    }

    // Anything else is assumed to be a broadcast reply.
    if !stream.pop(BROADCAST_LEGACY_SIZE - 1, &mut data) {
        stream.unpop(&data);
        return DecodeResult::Waiting;
    }

    let version = render_version(&data);
    let Some(layout) = BroadcastLayout::for_version(&version) else {
        log::warn!("unknown pokey protocol {}", version);
        return DecodeResult::Ignore;
    };

    let remaining = layout.frame_size() - data.len();
    if remaining > 0 && !stream.pop(remaining, &mut data) {
        stream.unpop(&data);
        return DecodeResult::Waiting;
    }

    match Message::decode_discovery(&data, layout) {
        Ok(message) => DecodeResult::Success(message),
        Err(e) => DecodeResult::Error(e),
    }
}

/// A stream plus decoder, one per connection.
#[derive(Debug, Default)]
pub struct FrameCodec {
    stream: ChannelStream,
}

impl FrameCodec {
    /// Create a new frame codec.
    pub fn new() -> Self {
        FrameCodec {
            stream: ChannelStream::new(),
        }
    }

    /// Add received data to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.stream.push(data);
    }

    /// Try to decode the next message.
    pub fn decode(&mut self) -> DecodeResult {
        decode_frame(&mut self.stream)
    }

    /// Decode every complete message currently buffered.
    ///
    /// Stops at the first `Waiting`. Ignored frames are skipped; codec errors
    /// are returned in place.
    pub fn drain(&mut self) -> Vec<Result<Message, ProtocolError>> {
        let mut out = Vec::new();
        loop {
            match self.decode() {
                DecodeResult::Waiting => break,
                DecodeResult::Success(message) => out.push(Ok(message)),
                DecodeResult::Ignore => continue,
                DecodeResult::Error(e) => out.push(Err(e)),
            }
        }
        out
    }

    /// Get the number of buffered bytes.
    pub fn buffered_len(&self) -> usize {
        self.stream.len()
    }

    /// Clear the buffer.
    pub fn clear(&mut self) {
        self.stream.clear();
    }
}
