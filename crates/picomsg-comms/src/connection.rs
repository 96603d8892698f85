//! One end of a link and its state machine.
//!
//! A connection moves `open → half-closed → closing → reclaimed`. Any thread
//! may request the close; only a worker finishes it, once it holds the
//! socket exclusively.
//!
//! Ring roles:
//! - `sending`: appended by `send`, drained into the socket by a worker.
//! - `reading`: filled from the socket by a worker, decoded by a worker or by
//!   a caller of `get`.
//!
//! In thread mode there is no socket: each side's `sending` ring is the other
//! side's `reading` ring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use picomsg_frame::{Decoded, FrameDecoder, RingBuffer, SpinLock, GOODBYE_FRAME, HEADER_SIZE};
use picomsg_transport::{IoStatus, PicoStream};
use tracing::{debug, error, info, warn};

use crate::config::{CommsConfig, Counters, Noise, Role, SayEvent, SayLevel, Stats};
use crate::error::SendError;
use crate::message::Message;
use crate::status::Status;
use crate::worker::Pulse;

const ALIVE: u32 = 0x5049_434F;
const RECLAIMED: u32 = 0xDEAD_C0DE;

/// The read direction has ended.
pub(crate) const READ_CLOSED: u8 = 1;
/// The write direction has ended.
pub(crate) const WRITE_CLOSED: u8 = 2;
pub(crate) const FULLY_CLOSED: u8 = READ_CLOSED | WRITE_CLOSED;

/// Largest slice handed to one `send` call.
const SEND_CHUNK: usize = 16 * 1024;
/// Reads attempted per pass before yielding to other connections.
const READS_PER_PASS: usize = 8;
/// Longest single sleep while waiting for a message or for send space.
const WAIT_SLICE: Duration = Duration::from_millis(10);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// How a connection reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// A non-blocking stream socket.
    Socket,
    /// A pair of rings shared with a sibling connection in this process.
    Shared,
}

/// How `send` handles a full ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPolicy {
    /// Fail at once.
    GiveUp,
    /// Wait for space, up to the configured send timeout.
    #[default]
    CanTimeOut,
}

#[derive(Debug, Default)]
struct ResultQueue {
    messages: VecDeque<Bytes>,
    bytes: usize,
}

pub(crate) struct Connection {
    guard: AtomicU32,
    id: u64,
    role: Role,
    backing: Backing,
    socket: RwLock<Option<PicoStream>>,
    reading: Arc<RingBuffer>,
    sending: Arc<RingBuffer>,
    decoder: SpinLock<FrameDecoder>,
    results: Mutex<ResultQueue>,
    arrived: Condvar,
    half_closed: AtomicU8,
    status: AtomicI32,
    want_close: AtomicBool,
    goodbye_queued: AtomicBool,
    closing_since: OnceLock<Instant>,
    config: RwLock<CommsConfig>,
    counters: Counters,
    pulse: Arc<Pulse>,
}

impl Connection {
    fn build(
        role: Role,
        backing: Backing,
        socket: Option<PicoStream>,
        reading: Arc<RingBuffer>,
        sending: Arc<RingBuffer>,
        config: &CommsConfig,
        pulse: Arc<Pulse>,
    ) -> Self {
        let mut config = config.clone();
        if config.name.is_empty() {
            config.name = role.default_name().to_string();
        }
        Self {
            guard: AtomicU32::new(ALIVE),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            role,
            backing,
            socket: RwLock::new(socket),
            reading,
            sending,
            decoder: SpinLock::new(FrameDecoder::new(config.largest_msg())),
            results: Mutex::new(ResultQueue::default()),
            arrived: Condvar::new(),
            half_closed: AtomicU8::new(0),
            status: AtomicI32::new(0),
            want_close: AtomicBool::new(false),
            goodbye_queued: AtomicBool::new(false),
            closing_since: OnceLock::new(),
            config: RwLock::new(config),
            counters: Counters::default(),
            pulse,
        }
    }

    /// A connection over a socket, with its own pair of rings.
    pub(crate) fn over_socket(
        stream: PicoStream,
        role: Role,
        config: &CommsConfig,
        pulse: Arc<Pulse>,
    ) -> picomsg_frame::Result<Self> {
        let bits = config.frame.ring_size_bits;
        let reading = Arc::new(RingBuffer::with_size_bits(bits, "read")?);
        let sending = Arc::new(RingBuffer::with_size_bits(bits, "send")?);
        let conn = Self::build(role, Backing::Socket, Some(stream), reading, sending, config, pulse);
        debug!(id = conn.id, ?role, "socket connection created");
        Ok(conn)
    }

    /// Two connections joined by swapped rings, for thread mode.
    pub(crate) fn shared_pair(
        config: &CommsConfig,
        pulse: Arc<Pulse>,
    ) -> picomsg_frame::Result<(Self, Self)> {
        let bits = config.frame.ring_size_bits;
        let down = Arc::new(RingBuffer::with_size_bits(bits, "parent-to-child")?);
        let up = Arc::new(RingBuffer::with_size_bits(bits, "child-to-parent")?);
        let parent = Self::build(
            Role::Parent,
            Backing::Shared,
            None,
            Arc::clone(&up),
            Arc::clone(&down),
            config,
            Arc::clone(&pulse),
        );
        let child = Self::build(Role::Child, Backing::Shared, None, down, up, config, pulse);
        debug!(parent = parent.id, child = child.id, "shared connection pair created");
        Ok((parent, child))
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn backing(&self) -> Backing {
        self.backing
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.guard.load(Ordering::Relaxed) == ALIVE
    }

    // ---- configuration and diagnostics ----

    fn settings(&self) -> std::sync::RwLockReadGuard<'_, CommsConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn config(&self) -> CommsConfig {
        self.settings().clone()
    }

    pub(crate) fn update_config(&self, f: impl FnOnce(&mut CommsConfig)) {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut config);
        if config.name.is_empty() {
            config.name = self.role.default_name().to_string();
        }
        // The rings are already allocated.
        config.frame.ring_size_bits = self.reading.capacity().trailing_zeros();
        let largest = config.largest_msg();
        drop(config);
        self.decoder.lock().set_max_payload(largest);
    }

    pub(crate) fn set_noise(&self, noise: Noise) {
        self.update_config(|config| config.noise = noise);
    }

    pub(crate) fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Hand a diagnostic to the configured sink if the noise mask allows it.
    pub(crate) fn say(&self, level: SayLevel, what: &str, detail: &str, count: Option<u64>) {
        let config = self.settings();
        if !config.noise.allows(level, self.role) {
            return;
        }
        let say = Arc::clone(&config.say);
        let name = config.name.clone();
        drop(config);
        say.say(&SayEvent {
            name: &name,
            role: self.role,
            level,
            what,
            detail,
            count,
        });
    }

    // ---- status and half-close ----

    pub(crate) fn status(&self) -> Option<Status> {
        Status::from_errno(self.status.load(Ordering::Acquire))
    }

    /// Record `status` unless one is already set.
    fn set_status(&self, status: Status) -> bool {
        self.status
            .compare_exchange(0, status.errno(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn half_closed(&self) -> u8 {
        self.half_closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_read_closed(&self) -> bool {
        self.half_closed() & READ_CLOSED != 0
    }

    pub(crate) fn is_write_closed(&self) -> bool {
        self.half_closed() & WRITE_CLOSED != 0
    }

    pub(crate) fn is_fully_closed(&self) -> bool {
        self.half_closed() == FULLY_CLOSED
    }

    /// Mark directions as ended. Both ended means closing.
    fn close_half(&self, bits: u8) {
        let before = self.half_closed.fetch_or(bits, Ordering::AcqRel);
        if before | bits == before {
            return;
        }
        if bits & READ_CLOSED != 0 && before & READ_CLOSED == 0 {
            debug!(id = self.id, "read half closed");
            self.arrived.notify_all();
        }
        if before | bits == FULLY_CLOSED {
            self.request_close("both halves closed");
        }
    }

    /// A fault that ends the connection.
    fn fail(&self, status: Status, detail: &str) {
        if self.set_status(status) {
            warn!(id = self.id, %status, detail, "connection failed");
            self.say(SayLevel::Event, "Failed", detail, Some(status.errno() as u64));
        }
        self.request_close(detail);
    }

    // ---- closing ----

    /// Ask for the connection to close. Returns whether this call started it.
    pub(crate) fn request_close(&self, why: &str) -> bool {
        self.set_status(Status::NotConnected);
        if self.want_close.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.closing_since.get_or_init(Instant::now);
        info!(id = self.id, why, "connection closing");
        self.say(SayLevel::Event, "Closing", why, None);
        self.queue_goodbye();
        self.arrived.notify_all();
        self.pulse.wake();
        true
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.want_close.load(Ordering::Acquire)
    }

    /// Append the goodbye frame once. Returns whether it is queued.
    fn queue_goodbye(&self) -> bool {
        if self.goodbye_queued.load(Ordering::Acquire) {
            return true;
        }
        if self.is_write_closed() {
            return false;
        }
        let Some(mut producer) = self.sending.try_producer() else {
            return false;
        };
        if self.goodbye_queued.load(Ordering::Acquire) {
            return true;
        }
        if producer.append_raw(&GOODBYE_FRAME) {
            self.goodbye_queued.store(true, Ordering::Release);
            debug!(id = self.id, "goodbye queued");
            true
        } else {
            false
        }
    }

    /// Worker-side completion of a requested close.
    ///
    /// Returns `true` once the connection holds no socket and both halves are
    /// closed. Until then the send ring keeps draining, bounded by the close
    /// grace.
    pub(crate) fn try_finish_close(&self) -> bool {
        if self.is_fully_closed() && self.backing == Backing::Shared {
            return true;
        }
        let grace = self.settings().close_grace;
        let since = *self.closing_since.get_or_init(Instant::now);
        let expired = since.elapsed() >= grace;
        let faulted = self.status().is_some_and(Status::is_fault);
        let write_done = self.is_write_closed();
        let goodbye = self.queue_goodbye();

        match self.backing {
            Backing::Socket => {
                let flushed = write_done || (goodbye && self.sending.is_empty());
                if !flushed && !expired && !faulted {
                    return false;
                }
                let Ok(mut socket) = self.socket.try_write() else {
                    return false;
                };
                if let Some(stream) = socket.take() {
                    if !flushed {
                        debug!(
                            id = self.id,
                            unsent = self.sending.len(),
                            "close grace expired with unsent bytes"
                        );
                    }
                    stream.shutdown();
                }
            }
            Backing::Shared => {
                if !goodbye && !write_done && !expired {
                    return false;
                }
            }
        }

        self.half_closed.fetch_or(FULLY_CLOSED, Ordering::AcqRel);
        self.arrived.notify_all();
        true
    }

    // ---- send path ----

    /// Queue one message.
    pub(crate) fn queue_send(&self, payload: &[u8], policy: SendPolicy) -> Result<(), SendError> {
        if self.is_closing() || self.is_write_closed() || self.status().is_some() {
            return Err(SendError::Closed(self.status()));
        }
        let (max, timeout) = {
            let config = self.settings();
            (config.largest_msg(), config.send_timeout)
        };
        if payload.is_empty() {
            self.fail(Status::IllegalSequence, "empty message");
            return Err(SendError::Empty);
        }
        if payload.len() > max {
            self.fail(Status::OutOfDomain, "message larger than largest_msg");
            return Err(SendError::TooLarge {
                size: payload.len(),
                max,
            });
        }
        let framed = payload.len() + HEADER_SIZE;
        if framed > self.sending.capacity() {
            return Err(SendError::ExceedsCapacity {
                size: payload.len(),
                capacity: self.sending.capacity(),
            });
        }

        let deadline = match policy {
            SendPolicy::GiveUp => None,
            SendPolicy::CanTimeOut => Some(Instant::now() + timeout),
        };
        loop {
            {
                let mut producer = self.sending.producer();
                if self.goodbye_queued.load(Ordering::Acquire) {
                    return Err(SendError::Closed(self.status()));
                }
                if producer.append_msg(payload) {
                    break;
                }
            }
            self.pulse.wake();
            let remaining = deadline.and_then(|d| d.checked_duration_since(Instant::now()));
            match remaining {
                Some(left) if !left.is_zero() && !self.is_closing() => {
                    std::thread::sleep(left.min(Duration::from_millis(1)));
                }
                _ => return Err(self.send_refused(payload.len())),
            }
        }

        self.counters.note_sent(payload.len());
        debug!(id = self.id, len = payload.len(), "message queued");
        self.say(SayLevel::Debug, "Queued", "", Some(payload.len() as u64));
        self.pulse.wake();
        Ok(())
    }

    fn send_refused(&self, size: usize) -> SendError {
        if self.is_closing() {
            return SendError::Closed(self.status());
        }
        let before = self.counters.note_send_failed();
        if before == 0 {
            warn!(id = self.id, size, "send queue full");
            self.say(SayLevel::Event, "SendFailed", "send queue full", Some(size as u64));
        }
        SendError::Full { size }
    }

    /// Whether queued bytes are still waiting to leave.
    pub(crate) fn is_still_sending(&self) -> bool {
        !self.sending.is_empty() && !self.is_write_closed() && !self.is_fully_closed()
    }

    // ---- receive path ----

    fn queue(&self) -> MutexGuard<'_, ResultQueue> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Message> {
        let mut queue = self.queue();
        let payload = queue.messages.pop_front()?;
        queue.bytes -= payload.len();
        Some(Message::new(payload))
    }

    /// Wait up to `timeout` for the next message.
    pub(crate) fn get(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some(msg) = self.pop() {
                return Some(msg);
            }
            let pumped = self.pump_decode();
            if pumped.is_some_and(|n| n > 0) {
                continue;
            }
            // Closed and nothing left to decode.
            if pumped.is_some() && (self.is_read_closed() || self.is_fully_closed()) {
                return self.pop();
            }
            let left = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => left,
                    _ => return None,
                },
                None => WAIT_SLICE,
            };

            self.pulse.wake();
            let queue = self.queue();
            if queue.messages.is_empty() {
                let _ = self
                    .arrived
                    .wait_timeout(queue, left.min(WAIT_SLICE))
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    /// Move complete messages from the read ring to the result queue.
    ///
    /// Returns `None` if another thread is decoding, else the number of
    /// messages moved.
    pub(crate) fn pump_decode(&self) -> Option<usize> {
        let mut consumer = self.reading.try_consumer()?;
        let mut decoder = self.decoder.try_lock()?;
        let budget_cap = self.settings().queue_budget;
        let mut moved = 0;

        loop {
            let budget = {
                let queue = self.queue();
                if queue.messages.is_empty() {
                    usize::MAX
                } else {
                    budget_cap.saturating_sub(queue.bytes)
                }
            };
            match decoder.decode(&mut consumer, budget) {
                Ok(Decoded::Incomplete) => break,
                Ok(Decoded::Message(payload)) => {
                    let len = payload.len();
                    {
                        let mut queue = self.queue();
                        queue.bytes += len;
                        queue.messages.push_back(payload);
                    }
                    self.counters.note_received(len);
                    self.arrived.notify_all();
                    moved += 1;
                }
                Ok(Decoded::Stalled { len }) => {
                    let before = self.counters.note_read_failed();
                    if before == 0 || (before + 1).is_power_of_two() {
                        warn!(
                            id = self.id,
                            len,
                            stalls = before + 1,
                            "result queue over budget, decoding stalled"
                        );
                        self.say(SayLevel::Event, "ReadStalled", "", Some(before + 1));
                    }
                    break;
                }
                Ok(Decoded::Goodbye) => {
                    debug!(id = self.id, "goodbye received");
                    self.say(SayLevel::Event, "Goodbye", "", None);
                    drop(decoder);
                    drop(consumer);
                    let bits = match self.backing {
                        // The peer no longer reads our ring either.
                        Backing::Shared => FULLY_CLOSED,
                        Backing::Socket => READ_CLOSED,
                    };
                    self.close_half(bits);
                    return Some(moved);
                }
                Err(err) => {
                    decoder.reset();
                    consumer.clear();
                    drop(decoder);
                    drop(consumer);
                    self.fail(Status::from_frame(&err), &err.to_string());
                    self.close_half(READ_CLOSED);
                    return Some(moved);
                }
            }
        }
        Some(moved)
    }

    // ---- socket passes ----

    /// Socket to read ring. Returns whether bytes moved.
    fn read_pass(&self) -> bool {
        if self.backing != Backing::Socket || self.is_read_closed() {
            return false;
        }
        let Ok(socket) = self.socket.try_read() else {
            return false;
        };
        let Some(stream) = socket.as_ref() else {
            return false;
        };
        let Some(mut producer) = self.reading.try_producer() else {
            return false;
        };

        let mut moved = false;
        let mut attempts = 0;
        while attempts < READS_PER_PASS {
            let span = producer.ask_unused();
            if span.is_empty() {
                break;
            }
            match stream.recv(span) {
                IoStatus::Done(n) => {
                    producer.gained(n);
                    moved = true;
                    attempts += 1;
                }
                IoStatus::Interrupted => continue,
                IoStatus::WouldBlock => break,
                IoStatus::Closed => {
                    drop(producer);
                    drop(socket);
                    self.close_half(READ_CLOSED);
                    return moved;
                }
                IoStatus::Failed(err) => {
                    drop(producer);
                    drop(socket);
                    self.fail(Status::from_io(&err), "socket read failed");
                    return moved;
                }
            }
        }
        moved
    }

    /// Send ring to socket. Returns whether bytes moved.
    fn send_pass(&self) -> bool {
        if self.backing != Backing::Socket || self.is_write_closed() {
            return false;
        }
        let Ok(socket) = self.socket.try_read() else {
            return false;
        };
        let Some(stream) = socket.as_ref() else {
            return false;
        };
        let Some(mut consumer) = self.sending.try_consumer() else {
            return false;
        };

        let mut moved = false;
        loop {
            let span = consumer.ask_used();
            if span.is_empty() {
                break;
            }
            let chunk = &span[..span.len().min(SEND_CHUNK)];
            match stream.send(chunk) {
                IoStatus::Done(n) => {
                    consumer.lost(n);
                    moved = true;
                }
                IoStatus::Interrupted => continue,
                IoStatus::WouldBlock => break,
                IoStatus::Closed => {
                    drop(consumer);
                    drop(socket);
                    // Gone without a goodbye: what we still hold is lost.
                    if !self.is_read_closed() {
                        self.fail(Status::BrokenPipe, "peer vanished while sending");
                    }
                    self.close_half(WRITE_CLOSED);
                    return moved;
                }
                IoStatus::Failed(err) => {
                    drop(consumer);
                    drop(socket);
                    self.fail(Status::from_io(&err), "socket write failed");
                    return moved;
                }
            }
        }
        moved
    }

    /// One worker round on this connection. Returns whether anything moved.
    pub(crate) fn service(&self) -> bool {
        if self.is_fully_closed() && self.socket_is_gone() {
            return false;
        }
        let read = self.read_pass();
        let decoded = self.pump_decode().is_some_and(|n| n > 0);
        let sent = self.send_pass();
        read || decoded || sent
    }

    fn socket_is_gone(&self) -> bool {
        match self.socket.try_read() {
            Ok(socket) => socket.is_none(),
            Err(_) => false,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let guard = self.guard.swap(RECLAIMED, Ordering::AcqRel);
        if guard != ALIVE {
            error!(id = self.id, guard, "connection reclaimed twice");
            return;
        }
        debug!(id = self.id, role = ?self.role, "connection dropped");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("backing", &self.backing)
            .field("half_closed", &self.half_closed())
            .field("status", &self.status())
            .field("closing", &self.is_closing())
            .finish()
    }
}
