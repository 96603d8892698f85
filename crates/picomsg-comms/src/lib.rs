//! Message connections between a parent and a child (process or thread).
//!
//! A [`Hub`] owns a registry of connections and the worker threads that move
//! bytes for them. Every user-facing call returns quickly: `send` copies into
//! a ring, `get` waits on a bounded timeout, and `close` only flips state for
//! a worker to finish.
//!
//! ```no_run
//! use std::time::Duration;
//! use picomsg_comms::{CommsConfig, Hub, HubConfig, SendPolicy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = Hub::new(HubConfig::default())?;
//! let (parent, child) = hub.init_pair(&CommsConfig::default())?;
//! parent.send_str("mary had a little lamb", SendPolicy::CanTimeOut)?;
//! let msg = child.get(Duration::from_secs(1)).expect("message");
//! assert_eq!(msg.as_str(), Some("mary had a little lamb"));
//! # Ok(())
//! # }
//! ```

pub mod comms;
pub mod config;
pub(crate) mod connection;
pub mod error;
pub mod hub;
pub mod message;
pub mod registry;
pub mod status;
pub(crate) mod worker;

pub use comms::Comms;
pub use config::{
    CommsConfig, HubConfig, Noise, Role, Say, SayEvent, SayLevel, Stats, TracingSay,
    DEFAULT_CLOSE_GRACE, DEFAULT_QUEUE_BUDGET, DEFAULT_SEND_TIMEOUT,
};
pub use connection::{Backing, SendPolicy};
pub use error::{CommsError, Result, SendError};
pub use hub::{ForkOptions, Forked, Hub};
pub use message::Message;
pub use status::Status;
