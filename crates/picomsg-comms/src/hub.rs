use std::os::fd::{IntoRawFd, RawFd};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use picomsg_transport::{ForkSide, PicoStream};
use tracing::{debug, info};

use crate::comms::Comms;
use crate::config::{CommsConfig, HubConfig, Role, SayLevel};
use crate::connection::Connection;
use crate::error::{CommsError, Result};
use crate::registry::Registry;
use crate::worker::{self, Pulse};

/// State shared by a hub's handles and its workers.
pub(crate) struct HubShared {
    pub(crate) registry: Registry<Connection>,
    pub(crate) pulse: Arc<Pulse>,
    pub(crate) config: HubConfig,
}

impl Drop for HubShared {
    fn drop(&mut self) {
        self.pulse.shut_down();
        // Every handle is gone, so every connection has been asked to close.
        let grace = self
            .registry
            .iter()
            .map(|(_, conn)| conn.config().close_grace)
            .max()
            .unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + grace + self.config.idle_floor;
        while !self.registry.is_empty() && Instant::now() < deadline {
            if !worker::work_once(&self.registry, &self.pulse) {
                thread::sleep(self.config.idle_floor);
            }
        }
        debug!(left = self.registry.len(), "hub stopped");
    }
}

/// Options for [`Hub::init_fork`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkOptions {
    /// The child is about to `exec`: it gets no connection, only a descriptor
    /// published in `__PicoSock__` for [`Hub::inherit`] in the new image.
    pub prepare_exec: bool,
}

/// Result of [`Hub::init_fork`], one per process.
#[derive(Debug)]
pub enum Forked {
    Parent { comms: Comms, child: libc::pid_t },
    Child { comms: Comms },
    /// Child side with `prepare_exec`: the socket survives `exec`.
    ExecReady { fd: RawFd },
}

/// Owner of a connection registry and the worker threads that drive it.
///
/// Cloning is cheap; all clones share the same workers. The workers stop once
/// the last clone and the last [`Comms`] are gone.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<HubShared>,
}

static GLOBAL: OnceLock<Hub> = OnceLock::new();

impl Hub {
    pub fn new(config: HubConfig) -> Result<Self> {
        let shared = Arc::new(HubShared {
            registry: Registry::new(config.registry_slots),
            pulse: Arc::new(Pulse::new()),
            config,
        });
        let threads = worker::spawn_workers(&shared, &shared.config)?;
        shared.pulse.set_workers(threads);
        info!(
            workers = shared.config.workers.max(1),
            slots = shared.registry.capacity(),
            "hub started"
        );
        Ok(Self { shared })
    }

    /// The process-wide hub, started on first use with default settings.
    pub fn global() -> Result<&'static Hub> {
        if let Some(hub) = GLOBAL.get() {
            return Ok(hub);
        }
        let hub = Hub::new(HubConfig::default())?;
        // A racing initializer wins; our hub's workers exit when it drops.
        Ok(GLOBAL.get_or_init(|| hub))
    }

    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Connections not yet reclaimed.
    pub fn connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// Adopt an already connected socket.
    pub fn init(&self, stream: PicoStream, role: Role, config: &CommsConfig) -> Result<Comms> {
        let conn = Connection::over_socket(stream, role, config, Arc::clone(&self.shared.pulse))?;
        self.register(conn)
    }

    /// Two connected ends in this process, over a socket pair.
    pub fn init_pair(&self, config: &CommsConfig) -> Result<(Comms, Comms)> {
        let (ours, theirs) = PicoStream::pair()?;
        let parent = self.init(ours, Role::Parent, config)?;
        let child = self.init(theirs, Role::Child, config)?;
        Ok((parent, child))
    }

    /// Fork the process with a connection between parent and child.
    ///
    /// The registry lock is held across `fork`, so the child never inherits it
    /// mid-mutation. In the child, connections inherited from the parent are
    /// dropped and a fresh set of workers is started.
    pub fn init_fork(&self, config: &CommsConfig, options: ForkOptions) -> Result<Forked> {
        let (ours, theirs) = PicoStream::pair()?;
        let pulse = Arc::clone(&self.shared.pulse);

        let mut wake_list = self.shared.pulse.lock_workers();
        let mut slots = self.shared.registry.lock();
        let side = picomsg_transport::fork();
        match side? {
            ForkSide::Parent { child } => {
                drop(wake_list);
                drop(theirs);
                let conn = Arc::new(Connection::over_socket(ours, Role::Parent, config, pulse)?);
                slots.insert(Arc::clone(&conn))?;
                drop(slots);
                conn.say(SayLevel::Event, "Started", "fork", Some(child as u64));
                info!(child, "forked child process");
                Ok(Forked::Parent {
                    comms: Comms::new(conn, self.clone()),
                    child,
                })
            }
            ForkSide::Child => {
                drop(ours);
                let stale = slots.drain();
                if options.prepare_exec {
                    wake_list.clear();
                    drop(wake_list);
                    drop(slots);
                    drop(stale);
                    theirs.stash_for_exec()?;
                    return Ok(Forked::ExecReady {
                        fd: theirs.into_raw_fd(),
                    });
                }
                let conn = Arc::new(Connection::over_socket(theirs, Role::Child, config, pulse)?);
                slots.insert(Arc::clone(&conn))?;
                drop(slots);
                drop(stale);

                // The parent's workers do not exist in this process.
                *wake_list = worker::spawn_workers(&self.shared, &self.shared.config)?;
                drop(wake_list);
                conn.say(SayLevel::Event, "Started", "fork", None);
                Ok(Forked::Child {
                    comms: Comms::new(conn, self.clone()),
                })
            }
        }
    }

    /// Run `f` on a new thread, connected to the caller through shared rings.
    pub fn init_thread<F, T>(&self, config: &CommsConfig, f: F) -> Result<(Comms, JoinHandle<T>)>
    where
        F: FnOnce(Comms) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (parent, child) = Connection::shared_pair(config, Arc::clone(&self.shared.pulse))?;
        let parent = self.register(parent)?;
        let child = self.register(child)?;
        let handle = thread::Builder::new()
            .name("picomsg-thread".into())
            .spawn(move || f(child))
            .map_err(CommsError::Spawn)?;
        Ok((parent, handle))
    }

    /// Pick up the socket a parent published before `exec`, if any.
    pub fn inherit(&self, config: &CommsConfig) -> Result<Option<Comms>> {
        match PicoStream::inherit()? {
            Some(stream) => self.init(stream, Role::Child, config).map(Some),
            None => Ok(None),
        }
    }

    fn register(&self, conn: Connection) -> Result<Comms> {
        let conn = Arc::new(conn);
        let slot = self.shared.registry.insert(Arc::clone(&conn))?;
        debug!(id = conn.id(), slot, role = ?conn.role(), "connection registered");
        conn.say(SayLevel::Event, "Started", "", None);
        self.shared.pulse.wake();
        Ok(Comms::new(conn, self.clone()))
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.shared.config)
            .field("connections", &self.connections())
            .finish()
    }
}
