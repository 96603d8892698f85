use std::ffi::{c_void, CString};
use std::os::raw::c_char;

use picomsg_comms::{Comms, CommsConfig};

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicoResult {
    Ok = 0,
    InvalidArgument = 1,
    NotConnected = 2,
    TransportError = 3,
    FrameError = 4,
    RegistryFull = 5,
    Internal = 99,
}

pub const PICO_SILENT: i32 = 0;
pub const PICO_NOISE_DEBUG_CHILD: i32 = 1;
pub const PICO_NOISE_DEBUG_PARENT: i32 = 2;
pub const PICO_NOISE_DEBUG: i32 = 3;
pub const PICO_NOISE_EVENTS_CHILD: i32 = 4;
pub const PICO_NOISE_EVENTS_PARENT: i32 = 8;
pub const PICO_NOISE_EVENTS: i32 = 12;

/// A received message. `data` holds `length` bytes plus a trailing NUL.
#[repr(C)]
#[derive(Debug)]
pub struct PicoMessage {
    pub data: *mut u8,
    pub length: i32,
}

impl Default for PicoMessage {
    fn default() -> Self {
        Self {
            data: std::ptr::null_mut(),
            length: 0,
        }
    }
}

/// Snapshot of a connection's settings and counters.
///
/// `name` stays valid until the next `picomsg_conf` on the same handle or
/// until the handle is destroyed.
#[repr(C)]
#[derive(Debug)]
pub struct PicoConfig {
    pub name: *const c_char,
    pub largest_msg: i32,
    pub noise: i32,
    pub total_received: i32,
    pub total_sent: i32,
}

impl Default for PicoConfig {
    fn default() -> Self {
        Self {
            name: std::ptr::null(),
            largest_msg: 0,
            noise: 0,
            total_received: 0,
            total_sent: 0,
        }
    }
}

pub type PicoCommsHandle = *mut c_void;

pub(crate) const HANDLE_ALIVE: u32 = 0x5049_434D;
pub(crate) const HANDLE_DEAD: u32 = 0x0BAD_F00D;

/// What a `PicoCommsHandle` points at.
///
/// A handle starts unconnected; `picomsg_fork` or `picomsg_pair` attach a
/// connection to it.
pub(crate) struct CommsHandle {
    pub(crate) guard: u32,
    pub(crate) config: CommsConfig,
    pub(crate) comms: Option<Comms>,
    pub(crate) name: CString,
}

impl CommsHandle {
    pub(crate) fn new(config: CommsConfig) -> Self {
        Self {
            guard: HANDLE_ALIVE,
            config,
            comms: None,
            name: CString::default(),
        }
    }

    pub(crate) fn with_comms(config: CommsConfig, comms: Comms) -> Self {
        Self {
            comms: Some(comms),
            ..Self::new(config)
        }
    }

    pub(crate) fn into_raw(self) -> PicoCommsHandle {
        Box::into_raw(Box::new(self)) as PicoCommsHandle
    }
}
