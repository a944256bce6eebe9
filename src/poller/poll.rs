use std::io;
use std::os::fd::RawFd;

use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

use super::{PollerData, PollerEvent};
use crate::Ready;

const EVENTS_SIZE_INIT: usize = 64;

/// The `poll(2)` backend: a dense `pollfd` array with `fd == -1` holes.
///
/// A channel's cookie is its slot index. When interest drops to zero the
/// slot is marked free and reused by the next registration; when no hole is
/// free the array doubles and the new entry takes the first slot of the new
/// half.
pub(crate) struct PollPoller {
    events: Vec<libc::pollfd>,
    /// One past the highest occupied slot; the prefix handed to `poll(2)`.
    used: usize,
}

impl std::fmt::Debug for PollPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollPoller")
            .field("events_size", &self.events.len())
            .field("events_used", &self.used)
            .finish()
    }
}

fn empty_pollfd() -> libc::pollfd {
    libc::pollfd {
        fd: -1,
        events: 0,
        revents: 0,
    }
}

impl PollPoller {
    pub(crate) fn new() -> io::Result<PollPoller> {
        Ok(PollPoller {
            events: vec![empty_pollfd(); EVENTS_SIZE_INIT],
            used: 0,
        })
    }

    pub(crate) fn update_channel(
        &mut self,
        fd: RawFd,
        events: Ready,
        cookie: &mut PollerData,
    ) -> io::Result<()> {
        let idx = match *cookie {
            PollerData::Slot(idx) => {
                if idx >= self.used {
                    return Err(io::ErrorKind::InvalidInput.into());
                }
                if self.events[idx].fd != fd {
                    return Err(io::ErrorKind::InvalidInput.into());
                }
                self.events[idx].events = 0;
                idx
            }
            _ => {
                // New registration: reuse a hole, or double the array and
                // take the first slot of the new half.
                let idx = match self.events.iter().position(|pfd| pfd.fd == -1) {
                    Some(idx) => idx,
                    None => {
                        let old_len = self.events.len();
                        self.events.resize(old_len * 2, empty_pollfd());
                        old_len
                    }
                };

                self.events[idx] = libc::pollfd {
                    fd,
                    events: 0,
                    revents: 0,
                };
                if idx + 1 > self.used {
                    self.used = idx + 1;
                }
                *cookie = PollerData::Slot(idx);
                idx
            }
        };

        if events.is_readable() {
            self.events[idx].events |= POLLIN;
        }
        if events.is_writable() {
            self.events[idx].events |= POLLOUT;
        }

        if self.events[idx].events == 0 {
            // No interest left: free the slot and pull `used` back over any
            // trailing holes.
            self.events[idx] = empty_pollfd();
            *cookie = PollerData::None;

            if idx + 1 == self.used {
                while self.used > 0 && self.events[self.used - 1].fd == -1 {
                    self.used -= 1;
                }
            }
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

        let mut nfds = match syscall!(poll(
            self.events.as_mut_ptr(),
            self.used as libc::nfds_t,
            timeout_ms,
        )) {
            Ok(n) => n as usize,
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => return Ok(()),
            Err(err) => return Err(err),
        };

        for pfd in self.events.iter().take(self.used) {
            if nfds == 0 || out.len() == cap {
                break;
            }
            if pfd.fd < 0 || pfd.revents == 0 {
                continue;
            }

            let mut revents = Ready::NONE;
            if pfd.revents & (POLLIN | POLLERR | POLLHUP | POLLNVAL) != 0 {
                revents |= Ready::READABLE;
            }
            if pfd.revents & (POLLOUT | POLLERR | POLLHUP | POLLNVAL) != 0 {
                revents |= Ready::WRITABLE;
            }
            out.push(PollerEvent {
                fd: pfd.fd,
                revents,
            });
            nfds -= 1;
        }

        Ok(())
    }
}
