use std::error::Error;
use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::time::Duration;

use picomsg_comms::{Comms, CommsConfig, CommsError, ForkOptions, Forked, Hub, Noise, SendPolicy};

use crate::error;
use crate::types::{
    CommsHandle, PicoCommsHandle, PicoConfig, PicoMessage, PicoResult, HANDLE_ALIVE, HANDLE_DEAD,
};
use crate::util;

fn with_handle<T>(
    handle: PicoCommsHandle,
    on_error: T,
    f: impl FnOnce(&mut CommsHandle) -> T,
) -> T {
    if handle.is_null() {
        let _ = error::set_invalid_argument("comms handle cannot be null");
        return on_error;
    }
    let comms_handle = {
        // SAFETY: Pointer validity is guaranteed by the caller.
        unsafe { &mut *(handle as *mut CommsHandle) }
    };
    if comms_handle.guard != HANDLE_ALIVE {
        let _ = error::set_invalid_argument("comms handle is not live");
        return on_error;
    }
    f(comms_handle)
}

fn with_comms<T>(handle: PicoCommsHandle, on_error: T, f: impl FnOnce(&Comms) -> T) -> T {
    with_handle(handle, None, |h| match h.comms.as_ref() {
        Some(comms) => Some(f(comms)),
        None => {
            let _ = error::set_invalid_argument("comms handle is not connected");
            None
        }
    })
    .unwrap_or(on_error)
}

fn noise_config(noise: i32) -> CommsConfig {
    CommsConfig::default().with_noise(Noise::from_bits(noise.clamp(0, 0xFF) as u8))
}

fn hub() -> Option<&'static Hub> {
    match Hub::global() {
        Ok(hub) => Some(hub),
        Err(err) => {
            let _ = error::map_comms_error(&err);
            None
        }
    }
}

/// The OS errno behind `err`, if any.
fn os_errno(err: &CommsError) -> i32 {
    let mut source: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(code) = current
            .downcast_ref::<std::io::Error>()
            .and_then(std::io::Error::raw_os_error)
        {
            return code;
        }
        source = current.source();
    }
    libc::EINVAL
}

/// Create an unconnected handle. Connect it with `picomsg_fork` or `picomsg_pair`.
#[no_mangle]
pub extern "C" fn picomsg_comms(noise: i32) -> PicoCommsHandle {
    crate::ffi_boundary(std::ptr::null_mut(), || {
        error::clear_error_state();
        CommsHandle::new(noise_config(noise)).into_raw()
    })
}

/// Connect `handle` to a new sibling handle over a socket pair.
///
/// # Safety
/// `handle` must be a live handle from `picomsg_comms` that is not yet connected.
#[no_mangle]
pub unsafe extern "C" fn picomsg_pair(handle: PicoCommsHandle, noise: i32) -> PicoCommsHandle {
    crate::ffi_boundary(std::ptr::null_mut(), || {
        error::clear_error_state();
        with_handle(handle, std::ptr::null_mut(), |h| {
            if h.comms.is_some() {
                let _ = error::set_invalid_argument("comms handle is already connected");
                return std::ptr::null_mut();
            }
            let Some(hub) = hub() else {
                return std::ptr::null_mut();
            };
            let sibling_config = noise_config(noise);
            let (ours, theirs) = match hub.init_pair(&h.config) {
                Ok(pair) => pair,
                Err(err) => {
                    let _ = error::map_comms_error(&err);
                    return std::ptr::null_mut();
                }
            };
            theirs.set_noise(sibling_config.noise);
            h.comms = Some(ours);
            CommsHandle::with_comms(sibling_config, theirs).into_raw()
        })
    })
}

/// Fork the process, connecting `handle` in both parent and child.
///
/// Returns the child's pid in the parent, `0` in the child, or a negative
/// errno on failure.
///
/// # Safety
/// `handle` must be a live handle from `picomsg_comms` that is not yet connected.
#[no_mangle]
pub unsafe extern "C" fn picomsg_fork(handle: PicoCommsHandle) -> i32 {
    crate::ffi_boundary(-libc::EINVAL, || {
        error::clear_error_state();
        with_handle(handle, -libc::EINVAL, |h| {
            if h.comms.is_some() {
                let _ = error::set_invalid_argument("comms handle is already connected");
                return -libc::EISCONN;
            }
            let Some(hub) = hub() else {
                return -libc::ENOMEM;
            };
            match hub.init_fork(&h.config, ForkOptions::default()) {
                Ok(Forked::Parent { comms, child }) => {
                    h.comms = Some(comms);
                    child
                }
                Ok(Forked::Child { comms }) => {
                    h.comms = Some(comms);
                    0
                }
                Ok(Forked::ExecReady { .. }) => -libc::EINVAL,
                Err(err) => {
                    let _ = error::map_comms_error(&err);
                    -os_errno(&err)
                }
            }
        })
    })
}

/// Close and release a handle. Queued messages are still flushed.
///
/// # Safety
/// `handle` must be null or a handle returned by `picomsg_comms` / `picomsg_pair`,
/// not destroyed before.
#[no_mangle]
pub unsafe extern "C" fn picomsg_destroy(handle: PicoCommsHandle) {
    crate::ffi_boundary((), || {
        if handle.is_null() {
            return;
        }
        let guard = {
            // SAFETY: Caller guarantees the pointer came from this library.
            unsafe { (*(handle as *mut CommsHandle)).guard }
        };
        if guard != HANDLE_ALIVE {
            tracing::error!(guard, "picomsg_destroy on a handle that is not live");
            error::set_error_message("picomsg_destroy on a handle that is not live");
            return;
        }
        // SAFETY: Allocated by `CommsHandle::into_raw` and checked live above.
        let mut boxed = unsafe { Box::from_raw(handle as *mut CommsHandle) };
        boxed.guard = HANDLE_DEAD;
        drop(boxed);
    });
}

/// Terminal status as an errno, `0` while open or not yet connected.
///
/// # Safety
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn picomsg_err(handle: PicoCommsHandle) -> i32 {
    crate::ffi_boundary(libc::EINVAL, || {
        with_handle(handle, libc::EINVAL, |h| {
            h.comms.as_ref().map_or(0, Comms::error_code)
        })
    })
}

/// Emit `what` (and `detail`, if not null) through the handle's say sink.
///
/// Always returns null, so C callers can `return picomsg_say(...)`.
///
/// # Safety
/// `handle` must be a live connected handle; `what` a valid C string; `detail`
/// null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn picomsg_say(
    handle: PicoCommsHandle,
    what: *const c_char,
    detail: *const c_char,
    count: i32,
) -> *mut c_void {
    crate::ffi_boundary(std::ptr::null_mut(), || {
        // SAFETY: Validated in helper.
        let Some(what) = (unsafe { util::required_str_arg(what, "what") }) else {
            return std::ptr::null_mut();
        };
        // SAFETY: Validated in helper.
        let detail = unsafe { util::optional_str_arg(detail) };
        with_comms(handle, (), |comms| {
            let mut line = what.to_string();
            if let Some(detail) = detail.filter(|d| !d.is_empty()) {
                line.push(' ');
                line.push_str(detail);
            }
            if count != 0 {
                line.push_str(&format!(" {count}"));
            }
            comms.say(&line);
        });
        std::ptr::null_mut()
    })
}

/// Queue a copy of `data[..length]`. Returns whether it was queued.
///
/// The caller keeps ownership of `data`.
///
/// # Safety
/// `handle` must be a live connected handle; `data` readable for `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn picomsg_send(handle: PicoCommsHandle, data: *const u8, length: i32) -> bool {
    crate::ffi_boundary(false, || {
        error::clear_error_state();
        let Ok(len) = usize::try_from(length) else {
            let _ = error::set_invalid_argument("length cannot be negative");
            return false;
        };
        // SAFETY: Validated in helper.
        let Some(payload) = (unsafe { util::bytes_arg(data, len, "data") }) else {
            return false;
        };
        with_comms(handle, false, |comms| {
            match comms.send(payload, SendPolicy::CanTimeOut) {
                Ok(()) => true,
                Err(err) => {
                    error::map_send_error(&err);
                    false
                }
            }
        })
    })
}

/// Queue a C string including its NUL terminator.
///
/// # Safety
/// `handle` must be a live connected handle; `text` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn picomsg_send_str(handle: PicoCommsHandle, text: *const c_char) -> bool {
    crate::ffi_boundary(false, || {
        error::clear_error_state();
        // SAFETY: Validated in helper.
        let Some(text) = (unsafe { util::required_str_arg(text, "text") }) else {
            return false;
        };
        with_comms(handle, false, |comms| {
            match comms.send_str(text, SendPolicy::CanTimeOut) {
                Ok(()) => true,
                Err(err) => {
                    error::map_send_error(&err);
                    false
                }
            }
        })
    })
}

/// Wait up to `seconds` for a message. A null `data` means none arrived.
///
/// Release the message with `picomsg_message_free`.
///
/// # Safety
/// `handle` must be a live connected handle.
#[no_mangle]
pub unsafe extern "C" fn picomsg_get(handle: PicoCommsHandle, seconds: f32) -> PicoMessage {
    crate::ffi_boundary(PicoMessage::default(), || {
        let timeout = Duration::try_from_secs_f32(seconds.max(0.0)).unwrap_or(Duration::MAX);
        with_comms(handle, PicoMessage::default(), |comms| match comms.get(timeout) {
            Some(msg) => message_out(msg.as_bytes()),
            None => PicoMessage::default(),
        })
    })
}

pub(crate) fn message_out(payload: &[u8]) -> PicoMessage {
    let Ok(length) = i32::try_from(payload.len()) else {
        error::set_error_message("message too large for PicoMessage");
        return PicoMessage::default();
    };
    let mut buffer = Vec::with_capacity(payload.len() + 1);
    buffer.extend_from_slice(payload);
    buffer.push(0);
    let data = Box::into_raw(buffer.into_boxed_slice()) as *mut u8;
    PicoMessage { data, length }
}

/// Free a message returned by `picomsg_get`.
///
/// # Safety
/// `message` must be null or point to a `PicoMessage` filled by `picomsg_get`.
#[no_mangle]
pub unsafe extern "C" fn picomsg_message_free(message: *mut PicoMessage) {
    crate::ffi_boundary((), || {
        if message.is_null() {
            return;
        }
        let message_ref = {
            // SAFETY: Pointer validity is guaranteed by the caller.
            unsafe { &mut *message }
        };
        if !message_ref.data.is_null() {
            let len = message_ref.length.max(0) as usize + 1;
            let slice_ptr = std::ptr::slice_from_raw_parts_mut(message_ref.data, len);
            // SAFETY: `data` was allocated as a `Box<[u8]>` of `length + 1` bytes.
            unsafe { drop(Box::from_raw(slice_ptr)) };
        }
        *message_ref = PicoMessage::default();
    });
}

/// Fill `out` with the handle's settings and counters.
///
/// # Safety
/// `handle` must be a live handle; `out` a valid writable pointer.
#[no_mangle]
pub unsafe extern "C" fn picomsg_conf(handle: PicoCommsHandle, out: *mut PicoConfig) -> PicoResult {
    crate::ffi_boundary(PicoResult::Internal, || {
        error::clear_error_state();
        if out.is_null() {
            return error::set_invalid_argument("out cannot be null");
        }
        with_handle(handle, PicoResult::InvalidArgument, |h| {
            let (config, stats) = match h.comms.as_ref() {
                Some(comms) => (comms.config(), comms.stats()),
                None => (h.config.clone(), Default::default()),
            };
            h.name = CString::new(config.name.replace('\0', "?")).unwrap_or_default();
            let conf = PicoConfig {
                name: h.name.as_ptr(),
                largest_msg: i32::try_from(config.largest_msg()).unwrap_or(i32::MAX),
                noise: i32::from(config.noise.bits()),
                total_received: i32::try_from(stats.total_received).unwrap_or(i32::MAX),
                total_sent: i32::try_from(stats.total_sent).unwrap_or(i32::MAX),
            };
            // SAFETY: Checked for null above.
            unsafe { *out = conf };
            PicoResult::Ok
        })
    })
}

/// Rename the connection in diagnostics.
///
/// # Safety
/// `handle` must be a live handle; `name` a valid C string.
#[no_mangle]
pub unsafe extern "C" fn picomsg_set_name(handle: PicoCommsHandle, name: *const c_char) -> PicoResult {
    crate::ffi_boundary(PicoResult::Internal, || {
        error::clear_error_state();
        // SAFETY: Validated in helper.
        let Some(name) = (unsafe { util::required_str_arg(name, "name") }) else {
            return PicoResult::InvalidArgument;
        };
        with_handle(handle, PicoResult::InvalidArgument, |h| {
            h.config.name = name.to_string();
            if let Some(comms) = h.comms.as_ref() {
                comms.set_name(name);
            }
            PicoResult::Ok
        })
    })
}

/// Replace the noise mask (`PICO_NOISE_*` bits).
///
/// # Safety
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn picomsg_set_noise(handle: PicoCommsHandle, noise: i32) -> PicoResult {
    crate::ffi_boundary(PicoResult::Internal, || {
        error::clear_error_state();
        with_handle(handle, PicoResult::InvalidArgument, |h| {
            let noise = Noise::from_bits(noise.clamp(0, 0xFF) as u8);
            h.config.noise = noise;
            if let Some(comms) = h.comms.as_ref() {
                comms.set_noise(noise);
            }
            PicoResult::Ok
        })
    })
}

/// Start closing the connection. Messages already received stay readable.
///
/// # Safety
/// `handle` must be a live handle; `reason` null or a valid C string.
#[no_mangle]
pub unsafe extern "C" fn picomsg_close(handle: PicoCommsHandle, reason: *const c_char) -> PicoResult {
    crate::ffi_boundary(PicoResult::Internal, || {
        error::clear_error_state();
        // SAFETY: Validated in helper.
        let reason = unsafe { util::optional_str_arg(reason) }.unwrap_or("closed");
        with_handle(handle, PicoResult::InvalidArgument, |h| match h.comms.as_ref() {
            Some(comms) => {
                comms.close(reason);
                PicoResult::Ok
            }
            None => {
                error::set_error_message("comms handle is not connected");
                PicoResult::NotConnected
            }
        })
    })
}

/// Whether queued bytes have not all left yet.
///
/// # Safety
/// `handle` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn picomsg_still_sending(handle: PicoCommsHandle) -> bool {
    crate::ffi_boundary(false, || {
        with_handle(handle, false, |h| {
            h.comms.as_ref().is_some_and(Comms::is_still_sending)
        })
    })
}

#[cfg(test)]
mod tests {
    use std::ffi::{CStr, CString};

    use super::*;
    use crate::types::PICO_SILENT;

    fn connected_pair() -> (PicoCommsHandle, PicoCommsHandle) {
        let parent = picomsg_comms(PICO_SILENT);
        assert!(!parent.is_null());
        // SAFETY: `parent` is a fresh live handle.
        let child = unsafe { picomsg_pair(parent, PICO_SILENT) };
        assert!(!child.is_null());
        (parent, child)
    }

    #[test]
    fn pair_send_str_and_get() {
        let (parent, child) = connected_pair();
        let text = CString::new("mary had a little lamb").unwrap();

        // SAFETY: live handles and valid C strings throughout.
        unsafe {
            assert!(picomsg_send_str(parent, text.as_ptr()));
            let mut msg = picomsg_get(child, 5.0);
            assert!(!msg.data.is_null());
            assert_eq!(msg.length, 23);
            let got = CStr::from_ptr(msg.data as *const c_char);
            assert_eq!(got.to_str().unwrap(), "mary had a little lamb");
            picomsg_message_free(&mut msg);
            assert!(msg.data.is_null());

            picomsg_destroy(parent);
            picomsg_destroy(child);
        }
    }

    #[test]
    fn empty_send_fails_and_sets_status() {
        let (parent, child) = connected_pair();
        // SAFETY: live handles.
        unsafe {
            assert!(!picomsg_send(parent, std::ptr::null(), 0));
            assert_eq!(picomsg_err(parent), libc::EILSEQ);
            assert!(!CStr::from_ptr(crate::picomsg_last_error()).to_bytes().is_empty());
            picomsg_destroy(parent);
            picomsg_destroy(child);
        }
    }

    #[test]
    fn conf_reports_name_and_counters() {
        let (parent, child) = connected_pair();
        let name = CString::new("Query").unwrap();
        // SAFETY: live handles and valid pointers.
        unsafe {
            assert_eq!(picomsg_set_name(parent, name.as_ptr()), PicoResult::Ok);
            assert!(picomsg_send(parent, b"abc".as_ptr(), 3));

            let mut conf = PicoConfig::default();
            assert_eq!(picomsg_conf(parent, &mut conf), PicoResult::Ok);
            assert_eq!(CStr::from_ptr(conf.name).to_str().unwrap(), "Query");
            assert_eq!(conf.total_sent, 1);
            assert_eq!(conf.noise, PICO_SILENT);

            let mut msg = picomsg_get(child, 5.0);
            picomsg_message_free(&mut msg);
            let mut conf = PicoConfig::default();
            assert_eq!(picomsg_conf(child, &mut conf), PicoResult::Ok);
            assert_eq!(CStr::from_ptr(conf.name).to_str().unwrap(), "Child");
            assert_eq!(conf.total_received, 1);

            picomsg_destroy(parent);
            picomsg_destroy(child);
        }
    }

    #[test]
    fn unconnected_handle_rejects_io() {
        let handle = picomsg_comms(PICO_SILENT);
        // SAFETY: live handle.
        unsafe {
            assert_eq!(picomsg_err(handle), 0);
            assert!(!picomsg_send(handle, b"x".as_ptr(), 1));
            assert!(picomsg_get(handle, 0.0).data.is_null());
            assert!(!picomsg_still_sending(handle));
            assert_eq!(
                picomsg_close(handle, std::ptr::null()),
                PicoResult::NotConnected
            );
            picomsg_destroy(handle);
        }
    }

    #[test]
    fn null_handles_are_rejected() {
        // SAFETY: null is handled explicitly.
        unsafe {
            assert_eq!(picomsg_err(std::ptr::null_mut()), libc::EINVAL);
            assert!(picomsg_pair(std::ptr::null_mut(), PICO_SILENT).is_null());
            assert!(!picomsg_still_sending(std::ptr::null_mut()));
            picomsg_destroy(std::ptr::null_mut());
            picomsg_message_free(std::ptr::null_mut());
        }
    }

    #[test]
    fn pairing_twice_is_rejected() {
        let (parent, child) = connected_pair();
        // SAFETY: live handles.
        unsafe {
            assert!(picomsg_pair(parent, PICO_SILENT).is_null());
            assert_eq!(picomsg_fork(parent), -libc::EISCONN);
            picomsg_destroy(parent);
            picomsg_destroy(child);
        }
    }
}
