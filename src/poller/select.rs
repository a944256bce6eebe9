use std::io;
use std::mem;
use std::os::fd::RawFd;

use super::{PollerData, PollerEvent};
use crate::Ready;

/// The `select(2)` backend: two master fd sets copied before each wait.
///
/// Channels need no cookie; membership in the master sets is the entire
/// registration state. `maxfd` is recomputed downward whenever the highest
/// registered fd drops all interest.
pub(crate) struct SelectPoller {
    maxfd: RawFd,
    read_master: libc::fd_set,
    write_master: libc::fd_set,
}

impl std::fmt::Debug for SelectPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectPoller")
            .field("maxfd", &self.maxfd)
            .finish()
    }
}

fn zeroed_fd_set() -> libc::fd_set {
    let mut set = unsafe { mem::zeroed::<libc::fd_set>() };
    unsafe { libc::FD_ZERO(&mut set) };
    set
}

impl SelectPoller {
    pub(crate) fn new() -> io::Result<SelectPoller> {
        Ok(SelectPoller {
            maxfd: 0,
            read_master: zeroed_fd_set(),
            write_master: zeroed_fd_set(),
        })
    }

    fn is_member(&self, fd: RawFd) -> bool {
        unsafe {
            libc::FD_ISSET(fd, &self.read_master) || libc::FD_ISSET(fd, &self.write_master)
        }
    }

    pub(crate) fn update_channel(
        &mut self,
        fd: RawFd,
        events: Ready,
        _cookie: &mut PollerData,
    ) -> io::Result<()> {
        if fd < 0 || fd >= libc::FD_SETSIZE as RawFd {
            return Err(io::ErrorKind::InvalidInput.into());
        }

        unsafe {
            libc::FD_CLR(fd, &mut self.read_master);
            libc::FD_CLR(fd, &mut self.write_master);
            if events.is_readable() {
                libc::FD_SET(fd, &mut self.read_master);
            }
            if events.is_writable() {
                libc::FD_SET(fd, &mut self.write_master);
            }
        }

        if self.is_member(fd) {
            if fd > self.maxfd {
                self.maxfd = fd;
            }
        } else if self.maxfd == fd {
            let mut candidate = fd;
            while candidate >= 0 && !self.is_member(candidate) {
                candidate -= 1;
            }
            self.maxfd = if candidate >= 0 { candidate } else { 0 };
        }

        Ok(())
    }

    pub(crate) fn poll(
        &mut self,
        out: &mut Vec<PollerEvent>,
        cap: usize,
        timeout_ms: i32,
    ) -> io::Result<()> {
        out.clear();

        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let timeout: *mut libc::timeval = if timeout_ms < 0 {
            std::ptr::null_mut()
        } else {
            tv.tv_sec = (timeout_ms / 1000) as libc::time_t;
            tv.tv_usec = ((timeout_ms % 1000) * 1000) as libc::suseconds_t;
            &mut tv
        };

        let mut read_set = self.read_master;
        let mut write_set = self.write_master;

        let mut nfds = match syscall!(select(
            self.maxfd + 1,
            &mut read_set,
            &mut write_set,
            std::ptr::null_mut(),
            timeout,
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(err) => return Err(err),
        };

        for fd in 0..=self.maxfd {
            if nfds == 0 || out.len() == cap {
                break;
            }

            let mut revents = Ready::NONE;
            unsafe {
                if libc::FD_ISSET(fd, &read_set) {
                    revents |= Ready::READABLE;
                }
                if libc::FD_ISSET(fd, &write_set) {
                    revents |= Ready::WRITABLE;
                }
            }
            if !revents.is_none() {
                out.push(PollerEvent { fd, revents });
                nfds -= 1;
            }
        }

        Ok(())
    }
}
