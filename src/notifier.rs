use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// A cross-thread wakeup primitive exposing a single readable fd.
///
/// [`send`] makes the fd readable; a looper registers the fd with read
/// interest and calls [`recv`] from the read callback to drain it. Tokens
/// carry no payload and spurious wakeups are acceptable.
///
/// Backed by `eventfd` (an 8-byte counter; all writes add to it, a read
/// returns and resets it) where the platform has one, and by a non-blocking
/// pipe carrying single bytes elsewhere.
///
/// [`send`] and [`recv`] are async-signal-safe: they perform a single
/// `write`/`read` syscall on an already-open fd, nothing more.
///
/// [`send`]: Notifier::send
/// [`recv`]: Notifier::recv
#[derive(Debug)]
pub struct Notifier {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    event: OwnedFd,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    receiver: OwnedFd,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    sender: OwnedFd,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Notifier {
    pub fn new() -> io::Result<Notifier> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` ensures the fd is valid.
        let event = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Notifier { event })
    }

    /// The fd to register for read interest.
    pub fn fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }

    /// Posts one wakeup token. Async-signal-safe.
    pub fn send(&self) {
        let data: u64 = 1;
        loop {
            let n = unsafe {
                libc::write(
                    self.event.as_raw_fd(),
                    &data as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            // EAGAIN means the counter is about to overflow; the fd is
            // already readable, which is all a token promises.
            if n != -1 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return;
            }
        }
    }

    /// Drains all pending tokens. Async-signal-safe.
    pub fn recv(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(
                    self.event.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            // A single read resets the counter to 0.
            if n != -1 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return;
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Notifier {
    pub fn new() -> io::Result<Notifier> {
        let mut fds = [-1 as libc::c_int; 2];
        syscall!(pipe(fds.as_mut_ptr()))?;
        // SAFETY: `pipe(2)` ensures both fds are valid.
        let receiver = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let sender = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        for fd in fds {
            let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
            syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
            let fd_flags = syscall!(fcntl(fd, libc::F_GETFD))?;
            syscall!(fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC))?;
        }
        Ok(Notifier { receiver, sender })
    }

    /// The fd to register for read interest.
    pub fn fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }

    /// Posts one wakeup token. Async-signal-safe.
    pub fn send(&self) {
        let data: u8 = 1;
        loop {
            let n = unsafe {
                libc::write(
                    self.sender.as_raw_fd(),
                    &data as *const u8 as *const libc::c_void,
                    1,
                )
            };
            // A full pipe already guarantees a readable fd.
            if n != -1 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return;
            }
        }
    }

    /// Drains all pending tokens. Async-signal-safe.
    pub fn recv(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.receiver.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                continue;
            }
            if n == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}
