use std::io;

use tracing::debug;

use crate::error::{Result, TransportError};

/// Which side of a `fork` the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkSide {
    Parent { child: libc::pid_t },
    Child,
}

impl ForkSide {
    pub fn is_parent(&self) -> bool {
        matches!(self, ForkSide::Parent { .. })
    }
}

/// Fork the current process.
///
/// Only the calling thread exists in the child. Callers must not hold locks
/// that other threads could be holding at the fork point, or must re-create
/// them in the child.
pub fn fork() -> Result<ForkSide> {
    // SAFETY: fork has no memory-safety preconditions of its own; the
    // single-thread constraint in the child is documented above.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(TransportError::Fork(io::Error::last_os_error())),
        0 => Ok(ForkSide::Child),
        child => {
            debug!(child, "forked child process");
            Ok(ForkSide::Parent { child })
        }
    }
}

/// Block until `child` exits. Returns its exit code, or `128 + signal`.
pub fn wait_child(child: libc::pid_t) -> Result<i32> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer.
        let rc = unsafe { libc::waitpid(child, &mut status, 0) };
        if rc == child {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(TransportError::Io(err));
        }
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(128 + libc::WTERMSIG(status))
    } else {
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_side_is_parent() {
        assert!(ForkSide::Parent { child: 1 }.is_parent());
        assert!(!ForkSide::Child.is_parent());
    }

    #[test]
    fn fork_and_wait_reports_exit_code() {
        match fork().unwrap() {
            ForkSide::Child => {
                // SAFETY: leave the forked test process without running the
                // parent's test harness teardown.
                unsafe { libc::_exit(7) }
            }
            ForkSide::Parent { child } => {
                assert_eq!(wait_child(child).unwrap(), 7);
            }
        }
    }
}
