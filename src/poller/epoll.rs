use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT};

use super::{PollerData, PollerEvent};
use crate::Ready;

const EVENTS_SIZE_INIT: usize = 16;

/// The `epoll(7)` backend: one epoll fd plus a kernel-events array that
/// doubles whenever a wait fills it completely.
pub(crate) struct EpollPoller {
    ep: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl std::fmt::Debug for EpollPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollPoller")
            .field("ep", &self.ep)
            .field("events_size", &self.events.len())
            .finish()
    }
}

fn zeroed_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

fn ready_to_epoll(events: Ready) -> u32 {
    let mut kind = 0;
    if events.is_readable() {
        kind |= EPOLLIN;
    }
    if events.is_writable() {
        kind |= EPOLLOUT;
    }
    kind as u32
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(EpollPoller {
            ep,
            events: vec![zeroed_event(); EVENTS_SIZE_INIT],
        })
    }

    pub(crate) fn update_channel(
        &mut self,
        fd: RawFd,
        events: Ready,
        cookie: &mut PollerData,
    ) -> io::Result<()> {
        let events_old = match *cookie {
            PollerData::Events(r) => r,
            _ => Ready::NONE,
        };
        if events == events_old {
            return Ok(());
        }

        let op = if events_old.is_none() {
            libc::EPOLL_CTL_ADD
        } else if events.is_none() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };

        let mut event = libc::epoll_event {
            events: ready_to_epoll(events),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, &mut event))?;

        *cookie = PollerData::Events(events);
        Ok(())
    }

    pub(crate) fn poll(
        &mut self,
        out: &mut Vec<PollerEvent>,
        cap: usize,
        timeout_ms: i32,
    ) -> io::Result<()> {
        out.clear();

        let nfds = match syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.len() as libc::c_int,
            timeout_ms,
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(err) => return Err(err),
        };

        for event in self.events.iter().take(nfds.min(cap)) {
            let bits = event.events as libc::c_int;
            let mut revents = Ready::NONE;
            if bits & (EPOLLIN | EPOLLERR | EPOLLHUP) != 0 {
                revents |= Ready::READABLE;
            }
            if bits & (EPOLLOUT | EPOLLERR | EPOLLHUP) != 0 {
                revents |= Ready::WRITABLE;
            }
            out.push(PollerEvent {
                fd: event.u64 as RawFd,
                revents,
            });
        }

        // A completely filled array means there may be more ready fds than
        // we had room for; be ready for them next time.
        if nfds == self.events.len() {
            let new_len = self.events.len() * 2;
            self.events.resize(new_len, zeroed_event());
        }

        Ok(())
    }
}
