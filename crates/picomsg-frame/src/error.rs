/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A length prefix that is neither a valid size nor the goodbye sentinel.
    #[error("illegal frame length {0}")]
    IllegalLength(i64),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Ring size class outside the supported range.
    #[error("ring size of 2^{bits} bytes is outside 2^{min}..=2^{max}")]
    InvalidCapacity { bits: u32, min: u32, max: u32 },

    /// The allocator refused a buffer.
    #[error("failed to allocate {size} bytes")]
    AllocationFailed { size: usize },
}

impl FrameError {
    /// The errno this transport reports for the error.
    pub fn errno(&self) -> i32 {
        match self {
            FrameError::IllegalLength(_) => libc::EILSEQ,
            FrameError::PayloadTooLarge { .. } => libc::EDOM,
            FrameError::InvalidCapacity { .. } => libc::EINVAL,
            FrameError::AllocationFailed { .. } => libc::ENOBUFS,
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
