use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use picomsg_frame::FrameConfig;
use serde::Serialize;

/// Default bound for `CanTimeOut` sends and for [`crate::Comms::get_default`].
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);
/// Default byte budget for decoded messages waiting to be collected.
pub const DEFAULT_QUEUE_BUDGET: usize = 16 * 1024 * 1024;
/// Default time a closing connection keeps flushing its send ring.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Which end of a link a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Parent,
    Child,
}

impl Role {
    pub fn default_name(self) -> &'static str {
        match self {
            Role::Parent => "Parent",
            Role::Child => "Child",
        }
    }

    pub fn is_parent(self) -> bool {
        self == Role::Parent
    }
}

/// Importance of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SayLevel {
    /// Per-message chatter (queueing, sizes).
    Debug,
    /// Lifecycle: started, disconnected, failed, deleted.
    Event,
    /// Explicit [`crate::Comms::say`] calls. Never filtered.
    Always,
}

/// Per-side noise mask.
///
/// A debug bit lets through debug chatter and lifecycle events for that side;
/// an event bit lets through lifecycle events only.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Noise(u8);

impl Noise {
    pub const SILENT: Noise = Noise(0);
    pub const DEBUG_CHILD: Noise = Noise(1);
    pub const DEBUG_PARENT: Noise = Noise(2);
    pub const DEBUG: Noise = Noise(3);
    pub const EVENTS_CHILD: Noise = Noise(4);
    pub const EVENTS_PARENT: Noise = Noise(8);
    pub const EVENTS: Noise = Noise(12);
    pub const ALL: Noise = Noise(15);

    pub const fn from_bits(bits: u8) -> Self {
        Noise(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether a diagnostic at `level` from `role` gets through.
    pub fn allows(self, level: SayLevel, role: Role) -> bool {
        let side = if role.is_parent() {
            self.0 >> 1
        } else {
            self.0
        };
        let debug = side & Self::DEBUG_CHILD.0 != 0;
        let events = side & Self::EVENTS_CHILD.0 != 0;
        match level {
            SayLevel::Always => true,
            SayLevel::Event => debug || events,
            SayLevel::Debug => debug,
        }
    }
}

impl BitOr for Noise {
    type Output = Noise;

    fn bitor(self, rhs: Noise) -> Noise {
        Noise(self.0 | rhs.0)
    }
}

impl fmt::Debug for Noise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Noise({:#06b})", self.0)
    }
}

/// One diagnostic, as handed to a [`Say`] sink.
#[derive(Debug, Clone, Copy)]
pub struct SayEvent<'a> {
    pub name: &'a str,
    pub role: Role,
    pub level: SayLevel,
    pub what: &'a str,
    pub detail: &'a str,
    pub count: Option<u64>,
}

/// Diagnostic sink. Events reach it only if the connection's [`Noise`] allows.
pub trait Say: Send + Sync {
    fn say(&self, event: &SayEvent<'_>);
}

impl<F> Say for F
where
    F: Fn(&SayEvent<'_>) + Send + Sync,
{
    fn say(&self, event: &SayEvent<'_>) {
        self(event)
    }
}

/// Default sink: forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSay;

impl Say for TracingSay {
    fn say(&self, event: &SayEvent<'_>) {
        let side = if event.role.is_parent() { "Us" } else { "Them" };
        match event.level {
            SayLevel::Debug => tracing::debug!(
                side,
                name = event.name,
                detail = event.detail,
                count = event.count,
                "{}",
                event.what
            ),
            SayLevel::Event | SayLevel::Always => tracing::info!(
                side,
                name = event.name,
                detail = event.detail,
                count = event.count,
                "{}",
                event.what
            ),
        }
    }
}

/// Per-connection configuration.
#[derive(Clone)]
pub struct CommsConfig {
    /// Display name. Empty means "Parent"/"Child" by role.
    pub name: String,
    pub noise: Noise,
    /// Largest message and ring size class.
    pub frame: FrameConfig,
    /// Upper bound for `CanTimeOut` sends. Default: 10 s.
    pub send_timeout: Duration,
    /// Bytes of decoded messages that may wait for the consumer. Default: 16 MiB.
    pub queue_budget: usize,
    /// How long a closing connection keeps flushing. Default: 250 ms.
    pub close_grace: Duration,
    pub say: Arc<dyn Say>,
}

impl CommsConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_noise(mut self, noise: Noise) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_largest_msg(mut self, bytes: usize) -> Self {
        self.frame.max_payload_size = bytes;
        self
    }

    pub fn with_ring_size_bits(mut self, bits: u32) -> Self {
        self.frame.ring_size_bits = bits;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_queue_budget(mut self, bytes: usize) -> Self {
        self.queue_budget = bytes;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn with_say(mut self, say: impl Say + 'static) -> Self {
        self.say = Arc::new(say);
        self
    }

    pub fn largest_msg(&self) -> usize {
        self.frame.max_payload_size
    }
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            noise: Noise::EVENTS,
            frame: FrameConfig::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            queue_budget: DEFAULT_QUEUE_BUDGET,
            close_grace: DEFAULT_CLOSE_GRACE,
            say: Arc::new(TracingSay),
        }
    }
}

impl fmt::Debug for CommsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommsConfig")
            .field("name", &self.name)
            .field("noise", &self.noise)
            .field("frame", &self.frame)
            .field("send_timeout", &self.send_timeout)
            .field("queue_budget", &self.queue_budget)
            .field("close_grace", &self.close_grace)
            .finish_non_exhaustive()
    }
}

/// Hub-wide configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Worker threads driving I/O. Default: 1.
    pub workers: usize,
    /// Registry slots (rounded up to a multiple of 64). Default: 64.
    pub registry_slots: usize,
    /// Shortest idle sleep. Default: 1 ms.
    pub idle_floor: Duration,
    /// Longest idle sleep. Default: 1 s.
    pub idle_ceiling: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            registry_slots: 64,
            idle_floor: Duration::from_millis(1),
            idle_ceiling: Duration::from_secs(1),
        }
    }
}

/// Running counters for one connection.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    send_failed: AtomicU64,
    read_failed: AtomicU64,
}

impl Counters {
    pub(crate) fn note_sent(&self, bytes: usize) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn note_received(&self, bytes: usize) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Returns the failure count before this one.
    pub(crate) fn note_send_failed(&self) -> u64 {
        self.send_failed.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the failure count before this one.
    pub(crate) fn note_read_failed(&self) -> u64 {
        self.read_failed.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats {
            total_sent: self.sent.load(Ordering::Relaxed),
            total_received: self.received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            send_failed: self.send_failed.load(Ordering::Relaxed),
            read_failed: self.read_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Messages queued for sending.
    pub total_sent: u64,
    /// Messages decoded and queued for the consumer.
    pub total_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Sends refused for lack of space.
    pub send_failed: u64,
    /// Decode passes stalled on the consumer queue budget.
    pub read_failed: u64,
}
