//! Non-blocking parent/child message passing.
//!
//! picomsg connects a parent and a child (a forked process, an exec'd
//! program, or a thread) and moves whole messages between them. Sends copy
//! into a ring and return; background workers do the socket I/O; receives
//! wait at most as long as asked.
//!
//! # Crate Structure
//!
//! - [`transport`]: Non-blocking local sockets, fork, exec hand-off
//! - [`frame`]: Ring buffers, spin flags, length-prefixed framing
//! - [`comms`]: Connections, the worker hub, the public `Comms` handle

/// Re-export transport types.
pub mod transport {
    pub use picomsg_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use picomsg_frame::*;
}

/// Re-export connection types.
pub mod comms {
    pub use picomsg_comms::*;
}

pub use picomsg_comms::{
    Comms, CommsConfig, CommsError, ForkOptions, Forked, Hub, HubConfig, Message, Noise,
    SendError, SendPolicy, Status,
};
