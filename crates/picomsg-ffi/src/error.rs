use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::c_char;

use picomsg_comms::{CommsError, SendError};

use crate::types::PicoResult;

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

pub(crate) fn clear_error_state() {
    LAST_ERROR.with(|state| *state.borrow_mut() = CString::default());
}

pub(crate) fn set_error_message(message: impl Into<String>) {
    let sanitized = message.into().replace('\0', "?");
    LAST_ERROR.with(|state| {
        *state.borrow_mut() = CString::new(sanitized).unwrap_or_default();
    });
}

pub(crate) fn set_invalid_argument(message: impl Into<String>) -> PicoResult {
    set_error_message(message);
    PicoResult::InvalidArgument
}

pub(crate) fn set_panic_error() {
    set_error_message("panic across FFI boundary");
}

pub(crate) fn map_comms_error(err: &CommsError) -> PicoResult {
    set_error_message(err.to_string());
    match err {
        CommsError::Transport(_) => PicoResult::TransportError,
        CommsError::Frame(_) => PicoResult::FrameError,
        CommsError::RegistryFull { .. } => PicoResult::RegistryFull,
        CommsError::Spawn(_) => PicoResult::Internal,
    }
}

pub(crate) fn map_send_error(err: &SendError) {
    set_error_message(err.to_string());
}

pub(crate) fn last_error_ptr() -> *const c_char {
    LAST_ERROR.with(|state| state.borrow().as_ptr())
}
