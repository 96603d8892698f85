use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::ring::{Consumer, DEFAULT_SIZE_BITS};

/// Frame header: a 4-byte big-endian length.
pub const HEADER_SIZE: usize = 4;

/// Length value announcing that the sender will write no more frames.
pub const GOODBYE: i32 = -1;

/// The complete goodbye frame as it appears on the wire.
pub const GOODBYE_FRAME: [u8; HEADER_SIZE] = GOODBYE.to_be_bytes();

/// Default largest payload: one framed message fills the default ring.
pub const DEFAULT_MAX_PAYLOAD: usize = (1 << DEFAULT_SIZE_BITS) - HEADER_SIZE;

/// Encode a payload length as a frame header.
#[inline]
pub fn encode_header(len: u32) -> [u8; HEADER_SIZE] {
    len.to_be_bytes()
}

/// Read a frame header as the signed length the wire carries.
#[inline]
pub fn decode_header(header: [u8; HEADER_SIZE]) -> i32 {
    i32::from_be_bytes(header)
}

/// Validate a received length prefix.
///
/// Returns `Ok(None)` for the goodbye sentinel and `Ok(Some(len))` for a
/// payload length in `1..=max_payload`.
pub fn check_length(raw: i32, max_payload: usize) -> Result<Option<usize>> {
    if raw == GOODBYE {
        return Ok(None);
    }
    if raw <= 0 {
        return Err(FrameError::IllegalLength(raw.into()));
    }
    let len = raw as usize;
    if len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: max_payload,
        });
    }
    Ok(Some(len))
}

/// Outcome of one decode step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Not enough bytes buffered yet.
    Incomplete,
    /// A complete body is buffered but the caller's budget cannot take it.
    Stalled { len: usize },
    /// A complete message.
    Message(Bytes),
    /// The peer announced the end of its stream.
    Goodbye,
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬─────────────────┐
/// │ Length       │ Payload         │
/// │ (4B BE)      │ (Length bytes)  │
/// └──────────────┴─────────────────┘
/// ```
/// A length of `0xFFFF_FFFF` (`-1`) carries no payload and means goodbye.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut, max_payload: usize) -> Result<()> {
    if payload.is_empty() {
        return Err(FrameError::IllegalLength(0));
    }
    let limit = max_payload.min(i32::MAX as usize);
    if payload.len() > limit {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: limit,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Append the goodbye frame.
pub fn encode_goodbye(dst: &mut BytesMut) {
    dst.put_slice(&GOODBYE_FRAME);
}

/// Decode a frame from a contiguous buffer.
///
/// Returns `Decoded::Incomplete` if the buffer doesn't contain a complete
/// frame yet. On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Decoded> {
    if src.len() < HEADER_SIZE {
        return Ok(Decoded::Incomplete);
    }

    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&src[..HEADER_SIZE]);
    let Some(len) = check_length(decode_header(header), max_payload)? else {
        src.advance(HEADER_SIZE);
        return Ok(Decoded::Goodbye);
    };

    if src.len() < HEADER_SIZE + len {
        return Ok(Decoded::Incomplete);
    }

    src.advance(HEADER_SIZE);
    Ok(Decoded::Message(src.split_to(len).freeze()))
}

/// Incremental decoder over a ring buffer.
///
/// Keeps the length of a header already taken out of the ring, so a body can
/// arrive over any number of reads.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    pending: Option<usize>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            pending: None,
            max_payload,
        }
    }

    /// Length of the body currently awaited, if a header was consumed.
    pub fn pending(&self) -> Option<usize> {
        self.pending
    }

    /// Change the largest accepted body. Applies from the next header.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload;
    }

    /// Run one step of the framing state machine.
    ///
    /// `budget` is how many payload bytes the caller can accept right now; a
    /// finished body larger than that stays in the ring as `Stalled`.
    pub fn decode(&mut self, ring: &mut Consumer<'_>, budget: usize) -> Result<Decoded> {
        let len = match self.pending {
            Some(len) => len,
            None => {
                if ring.len() < HEADER_SIZE {
                    return Ok(Decoded::Incomplete);
                }
                let mut header = [0u8; HEADER_SIZE];
                ring.get(&mut header);
                // A body must fit in the ring in one piece.
                let limit = self.max_payload.min(ring.capacity());
                match check_length(decode_header(header), limit)? {
                    None => return Ok(Decoded::Goodbye),
                    Some(len) => {
                        self.pending = Some(len);
                        len
                    }
                }
            }
        };

        if ring.len() < len {
            return Ok(Decoded::Incomplete);
        }
        if len > budget {
            return Ok(Decoded::Stalled { len });
        }

        let mut body = Vec::new();
        body.try_reserve_exact(len)
            .map_err(|_| FrameError::AllocationFailed { size: len })?;
        body.resize(len, 0);
        ring.get(&mut body);
        self.pending = None;
        Ok(Decoded::Message(Bytes::from(body)))
    }

    /// Forget a partially received frame.
    pub fn reset(&mut self) {
        self.pending = None;
    }
}

/// Configuration for the frame layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 1 MiB minus the header.
    pub max_payload_size: usize,
    /// Ring size class for each direction (`1 << bits` bytes). Default: 20.
    pub ring_size_bits: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            ring_size_bits: DEFAULT_SIZE_BITS,
        }
    }
}
