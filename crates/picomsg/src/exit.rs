use std::fmt;
use std::io;

use picomsg_comms::{CommsError, SendError};
use picomsg_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidInherited { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn comms_error(context: &str, err: CommsError) -> CliError {
    match err {
        CommsError::Transport(err) => transport_error(context, err),
        CommsError::Frame(err) => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        CommsError::Spawn(err) => io_error(context, err),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn send_error(context: &str, err: SendError) -> CliError {
    match err {
        SendError::Empty | SendError::TooLarge { .. } | SendError::ExceedsCapacity { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        SendError::Full { .. } => CliError::new(TIMEOUT, format!("{context}: {err}")),
        SendError::Closed(_) => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_send_queue_maps_to_timeout() {
        let err = send_error("send failed", SendError::Full { size: 10 });
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("send failed: "));
    }

    #[test]
    fn bad_inherited_socket_is_a_usage_error() {
        let err = comms_error(
            "inherit failed",
            CommsError::Transport(TransportError::InvalidInherited {
                var: "__PicoSock__",
                value: "x".into(),
            }),
        );
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn registry_full_is_internal() {
        let err = comms_error("init failed", CommsError::RegistryFull { capacity: 64 });
        assert_eq!(err.code, INTERNAL);
    }
}
