//! Background I/O workers.
//!
//! Each worker repeatedly walks the registry, services every connection, and
//! reclaims those that finished closing. When a round does nothing it sleeps
//! with a backoff that grows with the time since the last activity.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use picomsg_frame::{SpinLock, SpinLockGuard};
use tracing::{debug, trace};

use crate::config::{HubConfig, SayLevel};
use crate::connection::Connection;
use crate::error::{CommsError, Result};
use crate::hub::HubShared;
use crate::registry::Registry;

/// Activity clock and wake-up list shared by a hub and its connections.
#[derive(Debug)]
pub(crate) struct Pulse {
    epoch: Instant,
    last_activity_us: AtomicU64,
    shutdown: AtomicBool,
    workers: SpinLock<Vec<Thread>>,
}

impl Pulse {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_activity_us: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            workers: SpinLock::new(Vec::new()),
        }
    }

    /// Record activity now.
    pub(crate) fn touch(&self) {
        let now = self.epoch.elapsed().as_micros() as u64;
        self.last_activity_us.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub(crate) fn idle(&self) -> Duration {
        let now = self.epoch.elapsed().as_micros() as u64;
        let last = self.last_activity_us.load(Ordering::Relaxed);
        Duration::from_micros(now.saturating_sub(last))
    }

    /// Cut every worker's sleep short.
    pub(crate) fn wake(&self) {
        self.touch();
        if let Some(workers) = self.workers.try_lock() {
            workers.iter().for_each(Thread::unpark);
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.workers.lock().iter().for_each(Thread::unpark);
    }

    pub(crate) fn set_workers(&self, threads: Vec<Thread>) {
        *self.workers.lock() = threads;
    }

    /// Hold the wake-up list, e.g. across `fork`.
    pub(crate) fn lock_workers(&self) -> SpinLockGuard<'_, Vec<Thread>> {
        self.workers.lock()
    }
}

/// How long an idle worker sleeps.
///
/// `s = clamp(idle, sqrt(floor), sqrt(ceiling))` seconds, sleep `s²`: short
/// right after traffic, approaching the ceiling after a second or so of quiet.
pub(crate) fn idle_backoff(idle: Duration, floor: Duration, ceiling: Duration) -> Duration {
    let lo = floor.as_secs_f64().sqrt();
    let hi = ceiling.as_secs_f64().sqrt().max(lo);
    let s = idle.as_secs_f64().clamp(lo, hi);
    Duration::from_secs_f64(s * s)
}

/// One pass over the registry. Returns whether anything happened.
pub(crate) fn work_once(registry: &Registry<Connection>, pulse: &Pulse) -> bool {
    let mut busy = false;
    for (slot, conn) in registry.iter() {
        busy |= conn.service();
        if conn.is_closing() && conn.try_finish_close() {
            let removed = registry.remove_if(slot, |entry| Arc::ptr_eq(entry, &conn));
            if removed.is_some() {
                conn.say(SayLevel::Event, "Deleted", "", None);
                debug!(id = conn.id(), slot, "connection reclaimed");
            }
            busy = true;
            // `removed` drops here, outside the registry lock.
        }
    }
    if busy {
        pulse.touch();
    }
    busy
}

/// Start `config.workers` threads driving `shared`.
pub(crate) fn spawn_workers(shared: &Arc<HubShared>, config: &HubConfig) -> Result<Vec<Thread>> {
    let count = config.workers.max(1);
    let mut threads = Vec::with_capacity(count);
    for index in 0..count {
        let weak = Arc::downgrade(shared);
        let floor = config.idle_floor;
        let ceiling = config.idle_ceiling;
        let handle = thread::Builder::new()
            .name(format!("picomsg-worker-{index}"))
            .spawn(move || run(weak, index, floor, ceiling))
            .map_err(CommsError::Spawn)?;
        threads.push(handle.thread().clone());
    }
    Ok(threads)
}

fn run(shared: Weak<HubShared>, index: usize, floor: Duration, ceiling: Duration) {
    debug!(index, "worker started");
    loop {
        let Some(hub) = shared.upgrade() else {
            break;
        };
        if hub.pulse.is_shutdown() {
            break;
        }
        let busy = work_once(&hub.registry, &hub.pulse);
        let pause = (!busy).then(|| idle_backoff(hub.pulse.idle(), floor, ceiling));
        drop(hub);

        if let Some(pause) = pause {
            trace!(index, ?pause, "worker idle");
            thread::park_timeout(pause);
        }
    }
    debug!(index, "worker stopped");
}
