use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::Ready;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
mod poll;
mod select;

#[cfg(any(target_os = "linux", target_os = "android"))]
use epoll::EpollPoller;
use poll::PollPoller;
use select::SelectPoller;

/// The readiness backend driving a looper.
///
/// Used with [`set_fixed_backend`] to pin the process to one backend,
/// chiefly so tests can exercise the fallbacks on a platform where epoll
/// would otherwise always win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// `epoll(7)`. Linux and Android only.
    Epoll,
    /// `poll(2)`.
    Poll,
    /// `select(2)`.
    Select,
}

static FIXED_BACKEND: AtomicU8 = AtomicU8::new(0);

/// Pins every subsequently created looper to one backend.
///
/// `None` restores the default selection: epoll where compiled in, else
/// poll. Intended for tests; production code should leave this unset.
pub fn set_fixed_backend(backend: Option<Backend>) {
    let v = match backend {
        None => 0,
        Some(Backend::Epoll) => 1,
        Some(Backend::Poll) => 2,
        Some(Backend::Select) => 3,
    };
    FIXED_BACKEND.store(v, Ordering::Relaxed);
}

fn fixed_backend() -> Option<Backend> {
    match FIXED_BACKEND.load(Ordering::Relaxed) {
        1 => Some(Backend::Epoll),
        2 => Some(Backend::Poll),
        3 => Some(Backend::Select),
        _ => None,
    }
}

/// A readiness event reported by a poller: the fd and the folded ready set.
///
/// Events are keyed by fd; the looper resolves them to channels through its
/// fd table before dispatch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollerEvent {
    pub(crate) fd: RawFd,
    pub(crate) revents: Ready,
}

/// Per-channel backend cookie.
///
/// Its meaning is backend-specific: the epoll backend stores the
/// last-applied interest mask so add/modify/remove can be derived; the poll
/// backend stores the channel's slot in its `pollfd` array; the select
/// backend stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) enum PollerData {
    #[default]
    None,
    Events(Ready),
    Slot(usize),
}

/// The readiness abstraction: `(fd, interest)` in, ready events out.
///
/// All variants honor one contract: `update_channel` applies the difference
/// between the cookie and the current interest; `poll` reports at most `cap`
/// ready fds with error and hang-up conditions folded into both readable and
/// writable readiness.
#[derive(Debug)]
pub(crate) enum Poller {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(EpollPoller),
    Poll(PollPoller),
    Select(SelectPoller),
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        match fixed_backend() {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Some(Backend::Epoll) => EpollPoller::new().map(Poller::Epoll),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Some(Backend::Epoll) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "backend fixed to epoll, but the platform has none",
            )),
            Some(Backend::Poll) => PollPoller::new().map(Poller::Poll),
            Some(Backend::Select) => SelectPoller::new().map(Poller::Select),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            None => EpollPoller::new().map(Poller::Epoll),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            None => PollPoller::new().map(Poller::Poll),
        }
    }

    pub(crate) fn backend(&self) -> Backend {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(_) => Backend::Epoll,
            Poller::Poll(_) => Backend::Poll,
            Poller::Select(_) => Backend::Select,
        }
    }

    /// The cookie value meaning "no interest registered with this backend".
    pub(crate) fn init_channel(&self) -> PollerData {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(_) => PollerData::Events(Ready::NONE),
            Poller::Poll(_) => PollerData::None,
            Poller::Select(_) => PollerData::None,
        }
    }

    /// Applies the channel's current interest, deriving add/modify/remove
    /// from the cookie.
    pub(crate) fn update_channel(
        &mut self,
        fd: RawFd,
        events: Ready,
        cookie: &mut PollerData,
    ) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.update_channel(fd, events, cookie),
            Poller::Poll(p) => p.update_channel(fd, events, cookie),
            Poller::Select(p) => p.update_channel(fd, events, cookie),
        }
    }

    /// Waits for readiness, reporting at most `cap` events into `out`.
    ///
    /// `timeout_ms < 0` blocks indefinitely. An `EINTR`ed wait reports no
    /// events and is not an error.
    pub(crate) fn poll(
        &mut self,
        out: &mut Vec<PollerEvent>,
        cap: usize,
        timeout_ms: i32,
    ) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.poll(out, cap, timeout_ms),
            Poller::Poll(p) => p.poll(out, cap, timeout_ms),
            Poller::Select(p) => p.poll(out, cap, timeout_ms),
        }
    }
}
