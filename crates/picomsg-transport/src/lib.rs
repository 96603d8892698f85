//! Local stream-socket transport for picomsg.
//!
//! Provides the pieces the connection layer needs from the OS:
//! - non-blocking connected stream sockets ([`PicoStream`])
//! - socket pairs, for in-process siblings and for `fork`
//! - descriptor hand-off across `exec` through [`SOCKET_ENV`]
//!
//! This is the lowest layer of picomsg. Nothing here blocks.

pub mod error;
pub mod process;
pub mod stream;

pub use error::{Result, TransportError};
pub use process::{fork, wait_child, ForkSide};
pub use stream::{IoStatus, PicoStream, SOCKET_ENV};
