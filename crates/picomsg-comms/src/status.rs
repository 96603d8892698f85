use std::fmt;

use picomsg_frame::FrameError;

/// Terminal status of a connection, expressed as the errno it mirrors.
///
/// A connection starts without a status. The first status recorded sticks:
/// from then on the connection refuses sends, while messages already decoded
/// can still be drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `ENOTCONN`: closed on request.
    NotConnected,
    /// `ENOBUFS`: a buffer could not be allocated.
    NoBuffers,
    /// `EDOM`: a message length above the configured largest message.
    OutOfDomain,
    /// `EILSEQ`: a malformed length prefix (zero, or negative but not goodbye).
    IllegalSequence,
    /// `EPIPE`: the peer went away while we still had data for it.
    BrokenPipe,
    /// `EBADF`: the socket descriptor is unusable.
    BadDescriptor,
    /// Any other OS error from the socket.
    Os(i32),
}

impl Status {
    pub fn errno(self) -> i32 {
        match self {
            Status::NotConnected => libc::ENOTCONN,
            Status::NoBuffers => libc::ENOBUFS,
            Status::OutOfDomain => libc::EDOM,
            Status::IllegalSequence => libc::EILSEQ,
            Status::BrokenPipe => libc::EPIPE,
            Status::BadDescriptor => libc::EBADF,
            Status::Os(code) => code,
        }
    }

    /// `0` means "no status".
    pub fn from_errno(code: i32) -> Option<Self> {
        let status = match code {
            0 => return None,
            libc::ENOTCONN => Status::NotConnected,
            libc::ENOBUFS => Status::NoBuffers,
            libc::EDOM => Status::OutOfDomain,
            libc::EILSEQ => Status::IllegalSequence,
            libc::EPIPE => Status::BrokenPipe,
            libc::EBADF => Status::BadDescriptor,
            other => Status::Os(other),
        };
        Some(status)
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) if code != 0 => Status::from_errno(code).unwrap_or(Status::Os(code)),
            _ => Status::BadDescriptor,
        }
    }

    pub fn from_frame(err: &FrameError) -> Self {
        Status::from_errno(err.errno()).unwrap_or(Status::IllegalSequence)
    }

    /// Whether this status came from a fault rather than an orderly close.
    pub fn is_fault(self) -> bool {
        self != Status::NotConnected
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::io::Error::from_raw_os_error(self.errno()))
    }
}
