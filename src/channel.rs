use std::fmt;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, Weak};

use log::error;

use crate::poller::PollerData;
use crate::{Error, Looper, Ready, Result};

type Callback = Box<dyn FnMut() + Send>;

pub(crate) struct ChannelState {
    pub(crate) events: Ready,
    pub(crate) revents: Ready,
    pub(crate) cookie: PollerData,
}

/// The binding of a file descriptor and an interest set to one looper.
///
/// A channel does not own its fd; the connection, acceptor or notifier
/// holder does. Interest changes funnel through the owning looper's poller
/// update path, and the looper invokes [`handle_events`] with the poller's
/// reported readiness: the read callback first when the ready set intersects
/// [`Ready::READABLE`], then the write callback for [`Ready::WRITABLE`].
///
/// Like everything bound to a looper, a channel must only be mutated from
/// the thread driving that looper. Dropping the channel clears all interest
/// and deregisters it; failures on that path are logged, not propagated.
///
/// [`handle_events`]: Channel::handle_events
pub struct Channel {
    fd: RawFd,
    looper: Weak<Looper>,
    state: Mutex<ChannelState>,
    read_cb: Mutex<Option<Callback>>,
    write_cb: Mutex<Option<Callback>>,
}

impl Channel {
    /// Creates a channel for `fd` on `looper` with an initial interest set.
    pub fn new(looper: &Arc<Looper>, fd: RawFd, events: Ready) -> Result<Arc<Channel>> {
        if fd < 0 {
            return Err(Error::InvalidInput);
        }

        let channel = Arc::new(Channel {
            fd,
            looper: Arc::downgrade(looper),
            state: Mutex::new(ChannelState {
                events,
                revents: Ready::NONE,
                cookie: looper.init_cookie(),
            }),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
        });

        looper.register_channel(&channel)?;

        if !events.is_none() {
            let mut state = channel.state.lock().unwrap();
            looper.apply_interest(fd, events, &mut state.cookie)?;
        }

        Ok(channel)
    }

    /// The fd this channel watches.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The looper this channel is bound to, while it is alive.
    pub fn looper(&self) -> Option<Arc<Looper>> {
        self.looper.upgrade()
    }

    /// The current interest set.
    pub fn events(&self) -> Ready {
        self.state.lock().unwrap().events
    }

    /// The readiness reported by the most recent poll.
    pub fn revents(&self) -> Ready {
        self.state.lock().unwrap().revents
    }

    /// Adds `events` to the interest set.
    pub fn add_events(&self, events: Ready) -> Result<()> {
        if events.is_none() {
            return Err(Error::InvalidInput);
        }
        let looper = self.looper.upgrade().ok_or(Error::NotRunning)?;

        let mut state = self.state.lock().unwrap();
        state.events |= events;
        let events = state.events;
        looper.apply_interest(self.fd, events, &mut state.cookie)
    }

    /// Removes `events` from the interest set.
    pub fn del_events(&self, events: Ready) -> Result<()> {
        if events.is_none() {
            return Err(Error::InvalidInput);
        }
        let looper = self.looper.upgrade().ok_or(Error::NotRunning)?;

        let mut state = self.state.lock().unwrap();
        state.events -= events;
        let events = state.events;
        looper.apply_interest(self.fd, events, &mut state.cookie)
    }

    /// Installs the callback fired on readable readiness.
    pub fn set_read_callback(&self, cb: Callback) {
        *self.read_cb.lock().unwrap() = Some(cb);
    }

    /// Installs the callback fired on writable readiness.
    pub fn set_write_callback(&self, cb: Callback) {
        *self.write_cb.lock().unwrap() = Some(cb);
    }

    /// Records the readiness the poller reported for this cycle.
    pub(crate) fn set_revents(&self, revents: Ready) {
        self.state.lock().unwrap().revents = revents;
    }

    /// Clears all interest and removes the channel from its looper's fd
    /// table at once, without waiting for the last reference to drop.
    ///
    /// Needed when the fd will be re-registered (with a new channel)
    /// before this one's in-flight references are gone.
    pub(crate) fn detach(&self) {
        if let Some(looper) = self.looper.upgrade() {
            {
                let mut state = self.state.lock().unwrap();
                if !state.events.is_none() {
                    state.events = Ready::NONE;
                    if let Err(err) =
                        looper.apply_interest(self.fd, Ready::NONE, &mut state.cookie)
                    {
                        error!("failed to clear interest for fd {}: {}", self.fd, err);
                    }
                }
            }
            looper.remove_channel(self.fd, self);
        }
    }

    /// Fires the callbacks matching the recorded readiness, read first.
    ///
    /// A callback slot is emptied for the duration of its invocation so the
    /// callback may replace (or drop) itself; a replacement installed from
    /// inside the callback wins over the running one.
    pub(crate) fn handle_events(&self) {
        let revents = self.state.lock().unwrap().revents;

        if revents.is_readable() {
            let cb = self.read_cb.lock().unwrap().take();
            if let Some(mut cb) = cb {
                cb();
                let mut slot = self.read_cb.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        }

        if revents.is_writable() {
            let cb = self.write_cb.lock().unwrap().take();
            if let Some(mut cb) = cb {
                cb();
                let mut slot = self.write_cb.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(looper) = self.looper.upgrade() {
            let state = self.state.get_mut().unwrap();
            if !state.events.is_none() {
                state.events = Ready::NONE;
                if let Err(err) = looper.apply_interest(self.fd, Ready::NONE, &mut state.cookie) {
                    error!("failed to clear interest for fd {}: {}", self.fd, err);
                }
            }
            looper.remove_channel(self.fd, self);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &state.events)
            .field("revents", &state.revents)
            .finish()
    }
}
