use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, warn};

use super::{addr, sock};
use crate::{Channel, Circlebuf, Error, Looper, Ready, Result};

const READ_BUF_MIN_STEP: usize = 64;
const WRITE_BUF_MIN_STEP: usize = 64;
const SPILL_BUF_LEN: usize = 64 * 1024;

pub(crate) type EstablishedCb = dyn Fn(&Arc<TcpConnection>) + Send + Sync;
pub(crate) type ReadCb = dyn Fn(&Arc<TcpConnection>, &mut Circlebuf) + Send + Sync;
pub(crate) type WriteCompletedCb = dyn Fn(&Arc<TcpConnection>) + Send + Sync;
pub(crate) type HighWaterMarkCb = dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync;
pub(crate) type ClosedCb = dyn Fn(&Arc<TcpConnection>) + Send + Sync;
pub(crate) type RemoveCb = Box<dyn FnOnce(&Arc<TcpConnection>) + Send>;

/// The callback table shared by every connection a server or client
/// creates.
///
/// All callbacks run on the loop thread servicing the connection. The read
/// callback receives the connection's read buffer and must take all
/// buffered data out before returning; `write_completed` fires once per
/// drain event (the write buffer transitioning to empty) and
/// `high_water_mark` once per upward crossing of the configured mark, both
/// delivered on the *next* loop cycle.
#[derive(Clone, Default)]
pub struct TcpCallbacks {
    pub(crate) established: Option<Arc<EstablishedCb>>,
    pub(crate) read: Option<Arc<ReadCb>>,
    pub(crate) write_completed: Option<Arc<WriteCompletedCb>>,
    pub(crate) high_water_mark: Option<Arc<HighWaterMarkCb>>,
    pub(crate) closed: Option<Arc<ClosedCb>>,
}

impl fmt::Debug for TcpCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpCallbacks")
            .field("established", &self.established.is_some())
            .field("read", &self.read.is_some())
            .field("write_completed", &self.write_completed.is_some())
            .field("high_water_mark", &self.high_water_mark.is_some())
            .field("closed", &self.closed.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionConfig {
    pub(crate) read_buf_min: usize,
    pub(crate) read_buf_max: usize,
    pub(crate) write_buf_min: usize,
    pub(crate) high_water_mark: usize,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            read_buf_min: 128,
            read_buf_max: 1024 * 1024,
            write_buf_min: 128,
            high_water_mark: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Disconnecting,
    Disconnected,
}

/// One established TCP connection, bound to one looper.
///
/// Reads land in a circular read buffer (bounded by the configured
/// maximum) and are handed to the read callback; writes go out directly
/// when possible and are otherwise staged in an unbounded circular write
/// buffer drained on write readiness, with a high-water-mark alarm for
/// back-pressure. The connection is shared via `Arc`: the owning server or
/// client holds one reference, in-flight callbacks hold others, and the fd
/// closes when the last reference drops.
///
/// Methods may be called from any thread; off the loop thread they
/// re-dispatch themselves and report success immediately.
pub struct TcpConnection {
    looper: Arc<Looper>,
    fd: OwnedFd,
    channel: Mutex<Option<Arc<Channel>>>,
    state: Mutex<State>,
    read_buf: Mutex<Circlebuf>,
    read_buf_max: usize,
    write_buf: Mutex<Circlebuf>,
    high_water_mark: usize,
    callbacks: TcpCallbacks,
    write_completed_enabled: AtomicBool,
    high_water_mark_enabled: AtomicBool,
    remove_cb: Mutex<Option<RemoveCb>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    id: u64,
}

impl TcpConnection {
    pub(crate) fn new(
        looper: &Arc<Looper>,
        fd: OwnedFd,
        config: &ConnectionConfig,
        callbacks: TcpCallbacks,
        remove_cb: RemoveCb,
        id: u64,
    ) -> Result<Arc<TcpConnection>> {
        if config.read_buf_min == 0
            || config.read_buf_max == 0
            || config.read_buf_min > config.read_buf_max
            || config.write_buf_min == 0
            || config.high_water_mark == 0
            || config.write_buf_min > config.high_water_mark
        {
            return Err(Error::InvalidInput);
        }

        let read_buf = Circlebuf::new(config.read_buf_max, config.read_buf_min, READ_BUF_MIN_STEP)?;
        let write_buf = Circlebuf::new(0, config.write_buf_min, WRITE_BUF_MIN_STEP)?;
        let raw_fd = fd.as_raw_fd();

        let conn = Arc::new(TcpConnection {
            looper: Arc::clone(looper),
            fd,
            channel: Mutex::new(None),
            state: Mutex::new(State::Disconnected),
            read_buf: Mutex::new(read_buf),
            read_buf_max: config.read_buf_max,
            write_buf: Mutex::new(write_buf),
            high_water_mark: config.high_water_mark,
            callbacks,
            write_completed_enabled: AtomicBool::new(true),
            high_water_mark_enabled: AtomicBool::new(true),
            remove_cb: Mutex::new(Some(remove_cb)),
            context: Mutex::new(None),
            id,
        });

        let channel = Channel::new(looper, raw_fd, Ready::NONE)?;
        let weak = Arc::downgrade(&conn);
        channel.set_read_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read();
            }
        }));
        let weak = Arc::downgrade(&conn);
        channel.set_write_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        }));
        *conn.channel.lock().unwrap() = Some(channel);

        Ok(conn)
    }

    /// Enables read interest, marks the connection connected and fires the
    /// established callback.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        if !self.looper.is_loop_thread() {
            let conn = Arc::clone(self);
            self.looper.dispatch(move || {
                if let Err(err) = conn.start() {
                    error!("failed to start connection on fd {}: {}", conn.fd(), err);
                }
            });
            return Ok(());
        }

        let channel = self.channel().ok_or(Error::NotConnected)?;
        channel.add_events(Ready::READABLE)?;
        *self.state.lock().unwrap() = State::Connected;

        if let Some(cb) = &self.callbacks.established {
            cb(self);
        }
        Ok(())
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().unwrap().clone()
    }

    fn is_disconnected(&self) -> bool {
        *self.state.lock().unwrap() == State::Disconnected
    }

    /// The local address of the connection's socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        addr::local_addr(self.fd())
    }

    /// The peer address of the connection's socket.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        addr::peer_addr(self.fd())
    }

    /// Writes `data` to the peer.
    ///
    /// On the loop thread, an immediate `write(2)` is attempted when
    /// nothing is queued; whatever does not go out directly is staged in
    /// the write buffer and drained on write readiness. Off the loop
    /// thread, the payload is copied and the whole call re-dispatched.
    pub fn write(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidInput);
        }

        if !self.looper.is_loop_thread() {
            let conn = Arc::clone(self);
            let data = data.to_vec();
            self.looper.dispatch(move || {
                if let Err(err) = conn.write_on_loop(&data) {
                    warn!(
                        "deferred write of {} bytes on fd {} failed: {}",
                        data.len(),
                        conn.fd(),
                        err
                    );
                }
            });
            return Ok(());
        }

        self.write_on_loop(data)
    }

    fn write_on_loop(self: &Arc<Self>, data: &[u8]) -> Result<()> {
        if *self.state.lock().unwrap() != State::Connected {
            return Err(Error::NotConnected);
        }
        let channel = self.channel().ok_or(Error::NotConnected)?;
        let fd = self.fd();
        let interest = channel.events();

        let mut wb = self.write_buf.lock().unwrap();
        let mut written = 0;

        // Nothing queued and no write interest: try to write directly.
        if !interest.is_writable() && wb.is_empty() {
            loop {
                let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
                if n == -1 {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EINTR) => continue,
                        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                            // Wrote nothing; stage it all.
                        }
                        _ => {
                            error!("write(2) error on fd {}: {}", fd, err);
                            drop(wb);
                            self.handle_close();
                            return Err(err.into());
                        }
                    }
                } else {
                    written = n as usize;
                }
                break;
            }

            if written == data.len() {
                self.schedule_write_completed();
            }
        }

        // Stage whatever is left and make sure the channel watches for
        // write readiness.
        if written < data.len() {
            let len_old = wb.len();
            if let Err(err) = wb.append(&data[written..]) {
                error!("write buffer append failed on fd {}: {}", fd, err);
                drop(wb);
                self.handle_close();
                return Err(err);
            }
            let len_new = wb.len();

            if len_new >= self.high_water_mark && len_old < self.high_water_mark {
                self.schedule_high_water_mark(len_new);
            }

            if !interest.is_writable() {
                if let Err(err) = channel.add_events(Ready::WRITABLE) {
                    error!("enabling write interest failed on fd {}: {}", fd, err);
                    drop(wb);
                    self.handle_close();
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Half-closes the write direction.
    ///
    /// With data still queued the connection enters the disconnecting
    /// state and `shutdown(2)` is issued by the drain path once the write
    /// buffer empties; otherwise it is issued at once. Reads stay open
    /// until the peer's FIN.
    pub fn shutdown_wr(self: &Arc<Self>) -> Result<()> {
        if !self.looper.is_loop_thread() {
            let conn = Arc::clone(self);
            self.looper.dispatch(move || {
                let _ = conn.shutdown_wr();
            });
            return Ok(());
        }

        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Connected {
                return Ok(());
            }
            *state = State::Disconnecting;
        }

        let channel = self.channel().ok_or(Error::NotConnected)?;
        if !channel.events().is_writable() {
            if let Err(err) = sock::shutdown_wr(self.fd()) {
                warn!("shutdown(SHUT_WR) failed on fd {}: {}", self.fd(), err);
            }
        }
        Ok(())
    }

    /// Closes the connection.
    ///
    /// Teardown always runs on the loop thread on the next cycle, so it
    /// outlives any callback currently executing on this connection. Safe
    /// to call from any thread, any number of times.
    pub fn close(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        self.looper.dispatch(move || conn.handle_close());
    }

    /// Enables read interest again after [`disable_read`].
    ///
    /// [`disable_read`]: TcpConnection::disable_read
    pub fn enable_read(self: &Arc<Self>) -> Result<()> {
        if !self.looper.is_loop_thread() {
            let conn = Arc::clone(self);
            self.looper.dispatch(move || {
                let _ = conn.enable_read();
            });
            return Ok(());
        }

        if self.is_disconnected() {
            return Err(Error::NotConnected);
        }
        self.channel()
            .ok_or(Error::NotConnected)?
            .add_events(Ready::READABLE)
    }

    /// Stops reading from the socket; the peer's sends back-pressure into
    /// the kernel buffers.
    pub fn disable_read(self: &Arc<Self>) -> Result<()> {
        if !self.looper.is_loop_thread() {
            let conn = Arc::clone(self);
            self.looper.dispatch(move || {
                let _ = conn.disable_read();
            });
            return Ok(());
        }

        if self.is_disconnected() {
            return Err(Error::NotConnected);
        }
        self.channel()
            .ok_or(Error::NotConnected)?
            .del_events(Ready::READABLE)
    }

    /// Enables delivery of the write-completed callback.
    pub fn enable_write_completed(&self) {
        self.write_completed_enabled.store(true, Ordering::Relaxed);
    }

    /// Disables delivery of the write-completed callback.
    pub fn disable_write_completed(&self) {
        self.write_completed_enabled.store(false, Ordering::Relaxed);
    }

    /// Enables delivery of the high-water-mark callback.
    pub fn enable_high_water_mark(&self) {
        self.high_water_mark_enabled.store(true, Ordering::Relaxed);
    }

    /// Disables delivery of the high-water-mark callback.
    pub fn disable_high_water_mark(&self) {
        self.high_water_mark_enabled.store(false, Ordering::Relaxed);
    }

    /// Shrinks the read buffer, keeping `freespace_keep` bytes of headroom.
    pub fn shrink_read_buf(self: &Arc<Self>, freespace_keep: usize) -> Result<()> {
        if !self.looper.is_loop_thread() {
            let conn = Arc::clone(self);
            self.looper.dispatch(move || {
                let _ = conn.shrink_read_buf(freespace_keep);
            });
            return Ok(());
        }
        self.read_buf.lock().unwrap().shrink(freespace_keep)
    }

    /// Shrinks the write buffer, keeping `freespace_keep` bytes of headroom.
    pub fn shrink_write_buf(self: &Arc<Self>, freespace_keep: usize) -> Result<()> {
        if !self.looper.is_loop_thread() {
            let conn = Arc::clone(self);
            self.looper.dispatch(move || {
                let _ = conn.shrink_write_buf(freespace_keep);
            });
            return Ok(());
        }
        self.write_buf.lock().unwrap().shrink(freespace_keep)
    }

    /// Stores an opaque per-connection context value.
    pub fn set_context<T: Any + Send>(&self, context: T) {
        *self.context.lock().unwrap() = Some(Box::new(context));
    }

    /// Drops the stored context value, if any.
    pub fn clear_context(&self) {
        *self.context.lock().unwrap() = None;
    }

    /// Calls `f` with the stored context downcast to `T` (`None` when
    /// nothing is stored or the type does not match).
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut guard = self.context.lock().unwrap();
        f(guard.as_mut().and_then(|ctx| ctx.downcast_mut::<T>()))
    }

    fn schedule_write_completed(self: &Arc<Self>) {
        if !self.write_completed_enabled.load(Ordering::Relaxed) {
            return;
        }
        let cb = match &self.callbacks.write_completed {
            Some(cb) => Arc::clone(cb),
            None => return,
        };
        let conn = Arc::clone(self);
        self.looper.dispatch(move || {
            if !conn.is_disconnected() {
                cb(&conn);
            }
        });
    }

    fn schedule_high_water_mark(self: &Arc<Self>, water_mark: usize) {
        if !self.high_water_mark_enabled.load(Ordering::Relaxed) {
            return;
        }
        let cb = match &self.callbacks.high_water_mark {
            Some(cb) => Arc::clone(cb),
            None => return,
        };
        let conn = Arc::clone(self);
        self.looper.dispatch(move || {
            if !conn.is_disconnected() {
                cb(&conn, water_mark);
            }
        });
    }

    /// Scatter-read into the read buffer's free ranges plus a bounded
    /// stack spill buffer, then hand everything to the read callback.
    fn handle_read(self: &Arc<Self>) {
        let fd = self.fd();
        let mut spill = [0u8; SPILL_BUF_LEN];

        let mut rb = self.read_buf.lock().unwrap();
        if !rb.is_empty() {
            // The read callback must take everything out, every time.
            error!("read buffer not drained by the read callback, closing fd {}", fd);
            drop(rb);
            self.handle_close();
            return;
        }

        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; 3];
        let mut iov_cnt = 0;
        let freespace;
        {
            let (a, b) = rb.freespace_slices_mut();
            freespace = a.len() + b.len();
            if !a.is_empty() {
                iov[iov_cnt] = libc::iovec {
                    iov_base: a.as_mut_ptr() as *mut libc::c_void,
                    iov_len: a.len(),
                };
                iov_cnt += 1;
            }
            if !b.is_empty() {
                iov[iov_cnt] = libc::iovec {
                    iov_base: b.as_mut_ptr() as *mut libc::c_void,
                    iov_len: b.len(),
                };
                iov_cnt += 1;
            }
        }
        let spill_len = self.read_buf_max.saturating_sub(freespace).min(spill.len());
        if spill_len > 0 {
            iov[iov_cnt] = libc::iovec {
                iov_base: spill.as_mut_ptr() as *mut libc::c_void,
                iov_len: spill_len,
            };
            iov_cnt += 1;
        }

        let n = loop {
            let n = unsafe { libc::readv(fd, iov.as_ptr(), iov_cnt as libc::c_int) };
            if n == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => return,
                    Some(libc::ECONNRESET) => {
                        warn!("readv(2) error on fd {}: {}", fd, err);
                        drop(rb);
                        self.handle_close();
                        return;
                    }
                    _ => {
                        error!("readv(2) error on fd {}: {}", fd, err);
                        drop(rb);
                        self.handle_close();
                        return;
                    }
                }
            }
            break n as usize;
        };

        if n == 0 {
            // FIN from the peer.
            drop(rb);
            self.handle_close();
            return;
        }

        if n <= freespace {
            let _ = rb.commit(n);
        } else {
            let _ = rb.commit(freespace);
            if let Err(err) = rb.append(&spill[..n - freespace]) {
                error!("spilled read data lost on fd {}: {}", fd, err);
                drop(rb);
                self.handle_close();
                return;
            }
        }

        if let Some(cb) = &self.callbacks.read {
            cb(self, &mut rb);
        } else {
            // No consumer; a connection without a read callback must not
            // sit on buffered data.
            rb.erase_all();
        }
    }

    /// Gather-write the staged data; on a full drain, drop write interest,
    /// finish a pending half-close and announce the drain.
    fn handle_write(self: &Arc<Self>) {
        let fd = self.fd();
        let state = *self.state.lock().unwrap();
        if state == State::Disconnected {
            return;
        }
        let channel = match self.channel() {
            Some(channel) => channel,
            None => return,
        };

        let mut wb = self.write_buf.lock().unwrap();
        let mut iov = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; 2];
        let mut iov_cnt = 0;
        let data_len;
        {
            let (a, b) = wb.data_slices();
            data_len = a.len() + b.len();
            if !a.is_empty() {
                iov[iov_cnt] = libc::iovec {
                    iov_base: a.as_ptr() as *mut libc::c_void,
                    iov_len: a.len(),
                };
                iov_cnt += 1;
            }
            if !b.is_empty() {
                iov[iov_cnt] = libc::iovec {
                    iov_base: b.as_ptr() as *mut libc::c_void,
                    iov_len: b.len(),
                };
                iov_cnt += 1;
            }
        }

        if data_len == 0 {
            drop(wb);
            if let Err(err) = channel.del_events(Ready::WRITABLE) {
                error!("disabling write interest failed on fd {}: {}", fd, err);
                self.handle_close();
            }
            return;
        }

        let n = loop {
            let n = unsafe { libc::writev(fd, iov.as_ptr(), iov_cnt as libc::c_int) };
            if n == -1 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => return,
                    _ => {
                        error!("writev(2) error on fd {}: {}", fd, err);
                        drop(wb);
                        self.handle_close();
                        return;
                    }
                }
            }
            break n as usize;
        };

        if n > 0 {
            let _ = wb.erase(n);

            if n == data_len {
                drop(wb);
                if let Err(err) = channel.del_events(Ready::WRITABLE) {
                    error!("disabling write interest failed on fd {}: {}", fd, err);
                    self.handle_close();
                    return;
                }

                if state == State::Disconnecting {
                    if let Err(err) = sock::shutdown_wr(fd) {
                        warn!("shutdown(SHUT_WR) failed on fd {}: {}", fd, err);
                    }
                }

                self.schedule_write_completed();
            }
        }
    }

    /// Idempotent logical teardown: clear interest, drop the channel, fire
    /// the closed callback, then hand the connection back to its owner.
    fn handle_close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == State::Disconnected {
                return;
            }
            *state = State::Disconnected;
        }

        // Detach rather than wait for the last channel reference: the fd
        // table slot must be free even while a dispatch-held reference to
        // the channel is still alive.
        let channel = self.channel.lock().unwrap().take();
        if let Some(channel) = channel {
            channel.detach();
        }

        if let Some(cb) = &self.callbacks.closed {
            cb(self);
        }

        let remove = self.remove_cb.lock().unwrap().take();
        if let Some(remove) = remove {
            remove(self);
        }
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("fd", &self.fd.as_raw_fd())
            .field("state", &*self.state.lock().unwrap())
            .field("read_buffered", &self.read_buf.lock().unwrap().len())
            .field("write_buffered", &self.write_buf.lock().unwrap().len())
            .finish()
    }
}
