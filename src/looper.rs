use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::mem;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::poller::{Poller, PollerData, PollerEvent};
use crate::{Channel, Error, Notifier, Ready, Result};

const ACTIVE_CHANNELS_SIZE_INIT: usize = 16;

/// Identifies a timer scheduled on a [`Looper`].
///
/// An id is `(epoch seconds at creation, per-looper sequence)`. The default
/// value identifies no timer; cancelling it is a no-op, so an id field can
/// be left at `TimerId::default()` until a timer actually exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimerId {
    create_s: i64,
    seq: u64,
}

type Task = Box<dyn FnOnce() + Send>;
type TimerFn = Arc<Mutex<dyn FnMut() + Send>>;

struct TimerEntry {
    id: TimerId,
    interval_ms: i64,
    run: TimerFn,
}

/// Primary firing order is `(when_ms, seq)`; the id index exists for cancel.
#[derive(Default)]
struct Timers {
    by_when: BTreeMap<(i64, u64), TimerEntry>,
    by_id: BTreeMap<TimerId, (i64, u64)>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A single-threaded event loop.
///
/// One cycle of [`run`] performs, in order:
///
/// 1. a poller wait, with the timeout set to the time until the earliest
///    timer (indefinite when none is scheduled);
/// 2. dispatch of the ready channels, in poller-reported order;
/// 3. firing of every timer whose deadline has passed, in deadline order,
///    re-inserting periodic timers;
/// 4. a drain of the cross-thread pending-task queue, in FIFO order.
///
/// A looper is bound to the OS thread that calls `run`; channels, timers
/// and connections serviced by the looper must only be mutated from that
/// thread. The single cross-thread mechanism is [`dispatch`], which copies
/// its task (a `'static` closure owns everything it needs), appends it
/// under a mutex and pokes the looper's internal [`Notifier`]. A task
/// dispatched while a cycle is running executes no earlier than the next
/// cycle. Timer scheduling and cancellation re-dispatch themselves when
/// called off-thread, returning immediately.
///
/// [`quit`] and [`wakeup`] are async-signal-safe.
///
/// [`run`]: Looper::run
/// [`dispatch`]: Looper::dispatch
/// [`quit`]: Looper::quit
/// [`wakeup`]: Looper::wakeup
pub struct Looper {
    running: AtomicBool,
    loop_thread: Mutex<ThreadId>,
    poller: Mutex<Poller>,
    /// Number of off-thread interest updates waiting on the poller mutex.
    /// While nonzero, `run` parks on `ops_complete` instead of re-entering
    /// the wait, so the updates can get at the poller.
    waiting_ops: AtomicUsize,
    ops_complete: Condvar,
    poll_timeout_ms: Mutex<i32>,
    channels: Mutex<HashMap<RawFd, Weak<Channel>>>,
    pending: Mutex<Vec<Task>>,
    timers: Mutex<Timers>,
    timer_seq: AtomicU64,
    notifier: Arc<Notifier>,
    notifier_channel: Mutex<Option<Arc<Channel>>>,
}

impl Looper {
    /// Creates a looper bound, for now, to the calling thread.
    ///
    /// The binding moves to whichever thread calls [`run`].
    ///
    /// [`run`]: Looper::run
    pub fn new() -> Result<Arc<Looper>> {
        let poller = Poller::new()?;
        let notifier = Arc::new(Notifier::new()?);

        let looper = Arc::new(Looper {
            running: AtomicBool::new(false),
            loop_thread: Mutex::new(thread::current().id()),
            poller: Mutex::new(poller),
            waiting_ops: AtomicUsize::new(0),
            ops_complete: Condvar::new(),
            poll_timeout_ms: Mutex::new(-1),
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            timers: Mutex::new(Timers::default()),
            timer_seq: AtomicU64::new(0),
            notifier: Arc::clone(&notifier),
            notifier_channel: Mutex::new(None),
        });

        // The notifier exists solely to break the poller out of a blocking
        // wait; its channel drains the tokens and nothing more.
        let channel = Channel::new(&looper, notifier.fd(), Ready::READABLE)?;
        channel.set_read_callback(Box::new(move || notifier.recv()));
        *looper.notifier_channel.lock().unwrap() = Some(channel);

        Ok(looper)
    }

    /// Drives the loop on the calling thread until [`quit`] is called.
    ///
    /// Returns early only when the poller itself fails.
    ///
    /// [`quit`]: Looper::quit
    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        *self.loop_thread.lock().unwrap() = thread::current().id();

        let mut active: Vec<PollerEvent> = Vec::with_capacity(ACTIVE_CHANNELS_SIZE_INIT);
        let mut active_cap = ACTIVE_CHANNELS_SIZE_INIT;
        let mut scratch: Vec<Task> = Vec::new();

        while self.running.load(Ordering::SeqCst) {
            let timeout_ms = *self.poll_timeout_ms.lock().unwrap();
            {
                let mut poller = self.poller.lock().unwrap();
                // Yield the poller to any off-thread interest update
                // before parking in the wait.
                while self.waiting_ops.load(Ordering::SeqCst) > 0 {
                    poller = self.ops_complete.wait(poller).unwrap();
                }
                poller.poll(&mut active, active_cap, timeout_ms)?;
            }

            for event in active.iter() {
                let channel = {
                    let channels = self.channels.lock().unwrap();
                    channels.get(&event.fd).and_then(Weak::upgrade)
                };
                if let Some(channel) = channel {
                    channel.set_revents(event.revents);
                    channel.handle_events();
                }
            }
            // A full fill means there may have been more ready channels
            // than we had room for; be ready for them next time.
            if active.len() == active_cap {
                active_cap *= 2;
            }

            if !self.timers.lock().unwrap().by_when.is_empty() {
                self.handle_timers();
            }

            self.handle_pendings(&mut scratch);
        }

        // Give tasks dispatched during shutdown a last chance to run,
        // including anything they dispatch in turn.
        while !self.pending.lock().unwrap().is_empty() {
            self.handle_pendings(&mut scratch);
        }

        Ok(())
    }

    /// Stops the loop after the current cycle. Async-signal-safe.
    pub fn quit(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notifier.send();
    }

    /// Breaks the poller out of its wait without stopping the loop.
    /// Async-signal-safe.
    pub fn wakeup(&self) {
        self.notifier.send();
    }

    /// Returns true when called from the thread driving this looper.
    pub fn is_loop_thread(&self) -> bool {
        *self.loop_thread.lock().unwrap() == thread::current().id()
    }

    /// Enqueues `run` for execution on the loop thread on the next cycle.
    ///
    /// Thread-safe. Tasks enqueued from one thread run in enqueue order.
    /// If the looper is dropped before the task runs, the task is dropped
    /// un-run (releasing whatever it owns).
    pub fn dispatch(&self, run: impl FnOnce() + Send + 'static) {
        self.pending.lock().unwrap().push(Box::new(run));
        self.notifier.send();
    }

    /// Schedules `run` once at absolute epoch time `when_ms`.
    pub fn run_at(
        self: &Arc<Self>,
        when_ms: i64,
        run: impl FnMut() + Send + 'static,
    ) -> Result<TimerId> {
        if when_ms < 0 {
            return Err(Error::InvalidInput);
        }
        Ok(self.schedule_timer(when_ms, 0, run, -1))
    }

    /// Schedules `run` once, `delay_ms` from now.
    pub fn run_after(
        self: &Arc<Self>,
        delay_ms: i64,
        run: impl FnMut() + Send + 'static,
    ) -> Result<TimerId> {
        if delay_ms < 0 {
            return Err(Error::InvalidInput);
        }
        let now = now_ms();
        Ok(self.schedule_timer(now + delay_ms, 0, run, now))
    }

    /// Schedules `run` after `delay_ms`, then every `interval_ms`.
    pub fn run_every(
        self: &Arc<Self>,
        delay_ms: i64,
        interval_ms: i64,
        run: impl FnMut() + Send + 'static,
    ) -> Result<TimerId> {
        if delay_ms < 0 || interval_ms <= 0 {
            return Err(Error::InvalidInput);
        }
        let now = now_ms();
        Ok(self.schedule_timer(now + delay_ms, interval_ms, run, now))
    }

    /// Cancels a timer. Idempotent; unknown and default ids are no-ops.
    ///
    /// When called off the loop thread the cancellation is re-dispatched
    /// and this returns immediately.
    pub fn cancel(self: &Arc<Self>, id: TimerId) {
        if id == TimerId::default() {
            return;
        }
        if self.is_loop_thread() {
            self.cancel_on_loop(id);
        } else {
            let looper = Arc::clone(self);
            self.dispatch(move || looper.cancel_on_loop(id));
        }
    }

    fn schedule_timer(
        self: &Arc<Self>,
        when_ms: i64,
        interval_ms: i64,
        run: impl FnMut() + Send + 'static,
        now_ms: i64,
    ) -> TimerId {
        let id = TimerId {
            create_s: now_epoch_s(),
            seq: self.timer_seq.fetch_add(1, Ordering::Relaxed),
        };
        let run: TimerFn = Arc::new(Mutex::new(run));

        if self.is_loop_thread() {
            self.insert_timer(run, when_ms, interval_ms, id, now_ms);
        } else {
            let looper = Arc::clone(self);
            self.dispatch(move || looper.insert_timer(run, when_ms, interval_ms, id, -1));
        }
        id
    }

    fn insert_timer(&self, run: TimerFn, when_ms: i64, interval_ms: i64, id: TimerId, now: i64) {
        let key = (when_ms, id.seq);
        let is_new_min = {
            let mut timers = self.timers.lock().unwrap();
            let is_new_min = timers.by_when.keys().next().map_or(true, |&min| key < min);
            timers.by_when.insert(
                key,
                TimerEntry {
                    id,
                    interval_ms,
                    run,
                },
            );
            timers.by_id.insert(id, key);
            is_new_min
        };

        if is_new_min {
            let now = if now < 0 { now_ms() } else { now };
            *self.poll_timeout_ms.lock().unwrap() = clamp_timeout(when_ms - now);
        }
    }

    fn cancel_on_loop(&self, id: TimerId) {
        let was_min = {
            let mut timers = self.timers.lock().unwrap();
            let key = match timers.by_id.remove(&id) {
                Some(key) => key,
                None => return,
            };
            let was_min = timers.by_when.keys().next() == Some(&key);
            timers.by_when.remove(&key);
            was_min
        };

        if was_min {
            self.reset_poll_timeout(now_ms());
        }
    }

    fn handle_timers(&self) {
        let now = now_ms();
        loop {
            let run = {
                let mut timers = self.timers.lock().unwrap();
                let key = match timers.by_when.keys().next() {
                    Some(&key) => key,
                    None => break,
                };
                if key.0 > now {
                    break;
                }

                let entry = timers.by_when.remove(&key).unwrap();
                if entry.interval_ms > 0 {
                    // Re-insert before running so the callback can cancel
                    // its own timer by id.
                    let new_key = (key.0 + entry.interval_ms, key.1);
                    timers.by_id.insert(entry.id, new_key);
                    let run = Arc::clone(&entry.run);
                    timers.by_when.insert(new_key, entry);
                    run
                } else {
                    timers.by_id.remove(&entry.id);
                    entry.run
                }
            };

            (run.lock().unwrap())();
        }

        self.reset_poll_timeout(now);
    }

    fn reset_poll_timeout(&self, now: i64) {
        let timeout = {
            let timers = self.timers.lock().unwrap();
            match timers.by_when.keys().next() {
                Some(&(when, _)) => clamp_timeout(when - now),
                None => -1,
            }
        };
        *self.poll_timeout_ms.lock().unwrap() = timeout;
    }

    fn handle_pendings(&self, scratch: &mut Vec<Task>) {
        {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            // Swap the active buffer out under the lock, drain it outside.
            mem::swap(&mut *pending, scratch);
        }
        for task in scratch.drain(..) {
            task();
        }
    }

    /// The readiness backend this looper polls with.
    pub fn backend(&self) -> crate::Backend {
        self.poller.lock().unwrap().backend()
    }

    pub(crate) fn init_cookie(&self) -> PollerData {
        self.poller.lock().unwrap().init_channel()
    }

    pub(crate) fn register_channel(&self, channel: &Arc<Channel>) -> Result<()> {
        let mut channels = self.channels.lock().unwrap();
        if let Some(existing) = channels.get(&channel.fd()) {
            if existing.upgrade().is_some() {
                return Err(Error::Duplicate);
            }
        }
        channels.insert(channel.fd(), Arc::downgrade(channel));
        Ok(())
    }

    /// Removes `channel`'s entry from the fd table, leaving any newer
    /// channel registered on the same fd alone.
    pub(crate) fn remove_channel(&self, fd: RawFd, channel: &Channel) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(existing) = channels.get(&fd) {
            if std::ptr::eq(existing.as_ptr(), channel) {
                channels.remove(&fd);
            }
        }
    }

    pub(crate) fn apply_interest(
        &self,
        fd: RawFd,
        events: Ready,
        cookie: &mut PollerData,
    ) -> Result<()> {
        if self.is_loop_thread() {
            return self
                .poller
                .lock()
                .unwrap()
                .update_channel(fd, events, cookie)
                .map_err(Error::from);
        }

        // Off-thread: the loop may be parked inside the wait holding the
        // poller. Announce the update, kick the loop out of the wait, and
        // apply once it yields.
        self.waiting_ops.fetch_add(1, Ordering::SeqCst);
        self.notifier.send();
        let res = self
            .poller
            .lock()
            .unwrap()
            .update_channel(fd, events, cookie);
        if self.waiting_ops.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.ops_complete.notify_one();
        }
        res.map_err(Error::from)
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        // Channels deregister themselves only while the looper is alive;
        // here everything goes down together: un-run pending tasks are
        // dropped (their owned state released, never run), then timers,
        // channels, notifier and poller.
        let pending = mem::take(&mut *self.pending.lock().unwrap());
        if !pending.is_empty() {
            warn!("looper dropped with {} pending tasks", pending.len());
        }
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("backend", &self.poller.lock().unwrap().backend())
            .finish()
    }
}

fn now_epoch_s() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn clamp_timeout(delta_ms: i64) -> i32 {
    delta_ms.clamp(0, i32::MAX as i64) as i32
}
