use crate::status::Status;

/// Errors that can occur while creating connections or running the hub.
#[derive(Debug, thiserror::Error)]
pub enum CommsError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] picomsg_transport::TransportError),

    /// Frame-level error (ring allocation, size class).
    #[error("frame error: {0}")]
    Frame(#[from] picomsg_frame::FrameError),

    /// Every registry slot is taken.
    #[error("connection registry full ({capacity} slots)")]
    RegistryFull { capacity: usize },

    /// A worker or user thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommsError>;

/// Why a message was not queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The write side is closed, or the connection has a terminal status.
    #[error("connection closed for sending")]
    Closed(Option<Status>),

    /// Empty messages are not representable on the wire.
    #[error("empty message")]
    Empty,

    /// Longer than the configured largest message.
    #[error("message too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },

    /// The framed message can never fit in the send ring.
    #[error("message of {size} bytes exceeds send ring capacity {capacity}")]
    ExceedsCapacity { size: usize, capacity: usize },

    /// The send ring stayed full for the whole allowed wait.
    #[error("send queue full ({size} bytes not queued)")]
    Full { size: usize },
}

impl SendError {
    pub fn errno(&self) -> i32 {
        match self {
            SendError::Closed(Some(status)) => status.errno(),
            SendError::Closed(None) => libc::ENOTCONN,
            SendError::Empty => libc::EILSEQ,
            SendError::TooLarge { .. } => libc::EDOM,
            SendError::ExceedsCapacity { .. } => libc::EMSGSIZE,
            SendError::Full { .. } => libc::ENOBUFS,
        }
    }
}
