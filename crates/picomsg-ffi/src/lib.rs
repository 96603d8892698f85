//! picomsg-ffi: C-ABI exports for picomsg connections.
//!
//! All handles are served by the process-wide [`picomsg_comms::Hub::global`].

mod comms;
mod error;
mod types;
mod util;

use std::panic::AssertUnwindSafe;

pub use comms::{
    picomsg_close, picomsg_comms, picomsg_conf, picomsg_destroy, picomsg_err, picomsg_fork,
    picomsg_get, picomsg_message_free, picomsg_pair, picomsg_say, picomsg_send, picomsg_send_str,
    picomsg_set_name, picomsg_set_noise, picomsg_still_sending,
};
pub use types::{
    PicoCommsHandle, PicoConfig, PicoMessage, PicoResult, PICO_NOISE_DEBUG, PICO_NOISE_DEBUG_CHILD,
    PICO_NOISE_DEBUG_PARENT, PICO_NOISE_EVENTS, PICO_NOISE_EVENTS_CHILD, PICO_NOISE_EVENTS_PARENT,
    PICO_SILENT,
};

fn ffi_boundary<T>(on_panic: T, f: impl FnOnce() -> T) -> T {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            error::set_panic_error();
            on_panic
        }
    }
}

/// Message of the last failed call on this thread, or an empty string.
#[no_mangle]
pub extern "C" fn picomsg_last_error() -> *const std::os::raw::c_char {
    ffi_boundary(std::ptr::null(), error::last_error_ptr)
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;

    use super::*;

    #[test]
    fn last_error_starts_empty() {
        let handle = picomsg_comms(PICO_SILENT);
        let ptr = picomsg_last_error();
        assert!(!ptr.is_null());

        // SAFETY: picomsg_last_error returns a pointer to a thread-local CString.
        let text = unsafe { CStr::from_ptr(ptr).to_str().unwrap() };
        assert!(text.is_empty());
        // SAFETY: live handle from picomsg_comms.
        unsafe { picomsg_destroy(handle) };
    }

    #[test]
    fn panics_do_not_cross_the_boundary() {
        let value = ffi_boundary(7, || panic!("boom"));
        assert_eq!(value, 7);
        // SAFETY: as above.
        let text = unsafe { CStr::from_ptr(picomsg_last_error()).to_str().unwrap() };
        assert_eq!(text, "panic across FFI boundary");
    }
}
