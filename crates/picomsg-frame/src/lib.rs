//! Ring buffers and length-prefixed framing for picomsg.
//!
//! Every message travels as a 4-byte big-endian length followed by the
//! payload. A length of `-1` is the goodbye sentinel: the sender will write
//! nothing more in that direction.
//!
//! Messages are staged in [`RingBuffer`]s, fixed-capacity circular buffers
//! shared by exactly one appender and one consumer, and reassembled by a
//! [`FrameDecoder`] that tolerates any split of the byte stream.

pub mod codec;
pub mod error;
pub mod ring;
pub mod spin;

pub use codec::{
    check_length, decode_frame, decode_header, encode_frame, encode_goodbye, encode_header,
    Decoded, FrameConfig, FrameDecoder, DEFAULT_MAX_PAYLOAD, GOODBYE, GOODBYE_FRAME, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use ring::{Consumer, Producer, RingBuffer, DEFAULT_SIZE_BITS, MAX_SIZE_BITS, MIN_SIZE_BITS};
pub use spin::{SpinFlag, SpinFlagGuard, SpinLock, SpinLockGuard};
