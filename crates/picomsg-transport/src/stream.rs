use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::debug;

use crate::error::{Result, TransportError};

/// Environment variable carrying an inherited socket descriptor across `exec`.
pub const SOCKET_ENV: &str = "__PicoSock__";

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

const RECV_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

/// Result of one non-blocking transfer attempt.
#[derive(Debug)]
pub enum IoStatus {
    /// `n > 0` bytes moved.
    Done(usize),
    /// The socket is not ready; try again on a later pass.
    WouldBlock,
    /// A signal interrupted the call; retry now.
    Interrupted,
    /// The peer closed this direction (0-byte read, `EPIPE`, reset).
    Closed,
    /// A hard error. The connection cannot continue.
    Failed(io::Error),
}

impl IoStatus {
    fn from_ret(ret: isize) -> Self {
        if ret > 0 {
            return IoStatus::Done(ret as usize);
        }
        if ret == 0 {
            return IoStatus::Closed;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => IoStatus::WouldBlock,
            io::ErrorKind::Interrupted => IoStatus::Interrupted,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::NotConnected => IoStatus::Closed,
            _ => IoStatus::Failed(err),
        }
    }
}

/// A connected, non-blocking local stream socket.
///
/// Every call returns immediately; readiness is discovered by polling. Sends
/// never raise `SIGPIPE`, so a vanished peer shows up as [`IoStatus::Closed`].
pub struct PicoStream {
    inner: UnixStream,
}

impl PicoStream {
    /// Wrap a connected Unix stream, switching it to non-blocking mode.
    pub fn from_unix(stream: UnixStream) -> Result<Self> {
        let fd = stream.as_raw_fd();
        stream
            .set_nonblocking(true)
            .map_err(|source| TransportError::Configure { fd, source })?;
        suppress_sigpipe(fd)?;
        Ok(Self { inner: stream })
    }

    /// Create a connected pair of streams (`socketpair(AF_UNIX, SOCK_STREAM)`).
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair().map_err(TransportError::SocketPair)?;
        debug!(
            left = left.as_raw_fd(),
            right = right.as_raw_fd(),
            "created socket pair"
        );
        Ok((Self::from_unix(left)?, Self::from_unix(right)?))
    }

    /// Take ownership of a raw descriptor.
    ///
    /// # Safety
    /// `fd` must be an open, connected stream socket not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        // SAFETY: forwarded to the caller.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Self::from_unix(stream)
    }

    /// Recover the descriptor a parent left in [`SOCKET_ENV`] before `exec`.
    ///
    /// Returns `Ok(None)` when the variable is absent. The variable is removed
    /// so the descriptor cannot be claimed twice.
    pub fn inherit() -> Result<Option<Self>> {
        let Ok(value) = std::env::var(SOCKET_ENV) else {
            return Ok(None);
        };
        std::env::remove_var(SOCKET_ENV);

        let invalid = || TransportError::InvalidInherited {
            var: SOCKET_ENV,
            value: value.clone(),
        };
        let fd: RawFd = value.trim().parse().map_err(|_| invalid())?;
        if fd < 0 || !is_socket(fd) {
            return Err(invalid());
        }
        debug!(fd, "inherited socket from environment");
        // SAFETY: the parent handed this descriptor over to us, and it is a socket.
        unsafe { Self::from_raw_fd(fd) }.map(Some)
    }

    /// Prepare the socket to survive `exec` and publish it in [`SOCKET_ENV`].
    pub fn stash_for_exec(&self) -> Result<()> {
        let fd = self.as_raw_fd();
        // SAFETY: `fd` is open for the lifetime of `self`.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(TransportError::Configure {
                fd,
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: as above; only the close-on-exec bit changes.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(TransportError::Configure {
                fd,
                source: io::Error::last_os_error(),
            });
        }
        std::env::set_var(SOCKET_ENV, fd.to_string());
        debug!(fd, "stashed socket for exec");
        Ok(())
    }

    /// Non-blocking receive into `buf`.
    pub fn recv(&self, buf: &mut [u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Done(0);
        }
        // SAFETY: `buf` is valid for `buf.len()` writable bytes.
        let ret = unsafe {
            libc::recv(
                self.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                RECV_FLAGS,
            )
        };
        IoStatus::from_ret(ret)
    }

    /// Non-blocking send from `buf`.
    pub fn send(&self, buf: &[u8]) -> IoStatus {
        if buf.is_empty() {
            return IoStatus::Done(0);
        }
        // SAFETY: `buf` is valid for `buf.len()` readable bytes.
        let ret = unsafe {
            libc::send(
                self.as_raw_fd(),
                buf.as_ptr().cast::<libc::c_void>(),
                buf.len(),
                SEND_FLAGS,
            )
        };
        IoStatus::from_ret(ret)
    }

    /// Shut down both directions so the peer sees end-of-stream.
    pub fn shutdown(&self) {
        if let Err(err) = self.inner.shutdown(std::net::Shutdown::Both) {
            debug!(fd = self.as_raw_fd(), error = %err, "socket shutdown failed");
        }
    }
}

impl AsRawFd for PicoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl IntoRawFd for PicoStream {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw_fd()
    }
}

impl std::fmt::Debug for PicoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PicoStream")
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

fn is_socket(fd: RawFd) -> bool {
    // SAFETY: `stat` is plain data; fstat only writes into it.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `stat` is a valid out-pointer; an invalid fd yields -1.
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    rc == 0 && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn suppress_sigpipe(fd: RawFd) -> Result<()> {
    let on: libc::c_int = 1;
    // SAFETY: `on` is a valid c_int for the given length.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            (&on as *const libc::c_int).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(TransportError::Configure {
            fd,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn suppress_sigpipe(_fd: RawFd) -> Result<()> {
    // MSG_NOSIGNAL covers this per call.
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn recv_eventually(stream: &PicoStream, buf: &mut [u8]) -> IoStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match stream.recv(buf) {
                IoStatus::WouldBlock if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn pair_round_trip() {
        let (left, right) = PicoStream::pair().unwrap();
        assert!(matches!(left.send(b"hello"), IoStatus::Done(5)));

        let mut buf = [0u8; 16];
        match recv_eventually(&right, &mut buf) {
            IoStatus::Done(n) => assert_eq!(&buf[..n], b"hello"),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn empty_socket_would_block() {
        let (_left, right) = PicoStream::pair().unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(right.recv(&mut buf), IoStatus::WouldBlock));
    }

    #[test]
    fn closed_peer_reports_closed() {
        let (left, right) = PicoStream::pair().unwrap();
        drop(left);

        let mut buf = [0u8; 4];
        assert!(matches!(recv_eventually(&right, &mut buf), IoStatus::Closed));
        // No SIGPIPE: the send reports the broken pipe as a closed direction.
        assert!(matches!(right.send(b"x"), IoStatus::Closed));
    }

    #[test]
    fn shutdown_is_seen_by_peer() {
        let (left, right) = PicoStream::pair().unwrap();
        left.shutdown();
        let mut buf = [0u8; 4];
        assert!(matches!(recv_eventually(&right, &mut buf), IoStatus::Closed));
    }

    #[test]
    fn full_socket_would_block() {
        let (left, _right) = PicoStream::pair().unwrap();
        let chunk = [0u8; 64 * 1024];
        let mut saw_would_block = false;
        for _ in 0..1024 {
            match left.send(&chunk) {
                IoStatus::Done(_) => continue,
                IoStatus::WouldBlock => {
                    saw_would_block = true;
                    break;
                }
                other => panic!("unexpected status {other:?}"),
            }
        }
        assert!(saw_would_block);
    }

    #[test]
    fn stash_and_inherit_descriptor() {
        let (left, right) = PicoStream::pair().unwrap();
        right.stash_for_exec().unwrap();
        let fd = right.into_raw_fd();
        assert_eq!(std::env::var(SOCKET_ENV).unwrap(), fd.to_string());

        let inherited = PicoStream::inherit().unwrap().expect("descriptor should be inherited");
        assert_eq!(inherited.as_raw_fd(), fd);
        assert!(std::env::var(SOCKET_ENV).is_err());

        assert!(matches!(left.send(b"ok"), IoStatus::Done(2)));
        let mut buf = [0u8; 2];
        assert!(matches!(
            recv_eventually(&inherited, &mut buf),
            IoStatus::Done(2)
        ));
    }
}
