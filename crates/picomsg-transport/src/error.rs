/// Errors that can occur in picomsg transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to create a connected socket pair.
    #[error("failed to create socket pair: {0}")]
    SocketPair(std::io::Error),

    /// Failed to fork the process.
    #[error("failed to fork: {0}")]
    Fork(std::io::Error),

    /// Failed to configure a socket descriptor.
    #[error("failed to configure socket {fd}: {source}")]
    Configure {
        fd: i32,
        source: std::io::Error,
    },

    /// The inherited-socket environment variable does not name a usable descriptor.
    #[error("invalid inherited socket {var}={value:?}")]
    InvalidInherited { var: &'static str, value: String },

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
