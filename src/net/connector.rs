use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use log::{trace, warn};

use super::{addr, sock};
use crate::{Channel, Error, Looper, Ready, Result, TimerId};

type ConnectedCb = Box<dyn FnMut(OwnedFd) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
}

/// A non-blocking TCP connect state machine with exponential-backoff
/// retry.
///
/// `connect` issues a non-blocking `connect(2)`. A definitive answer
/// arrives via write readiness on a probe channel; transient failures
/// (`ECONNREFUSED`, `ENETUNREACH`, ... ) schedule a retry timer whose
/// delay doubles up to the configured maximum. A TCP self-connection
/// (the kernel wiring an ephemeral port to itself) is detected and treated
/// as one more transient failure. Only [`cancel`] stops the retrying; the
/// caller never sees a backoff-eligible failure as terminal.
///
/// [`cancel`]: TcpConnector::cancel
pub struct TcpConnector {
    inner: Arc<Inner>,
}

struct ConnectorState {
    working: bool,
    phase: Phase,
    fd: Option<OwnedFd>,
    channel: Option<Arc<Channel>>,
    cur_delay_ms: i64,
    retry_timer: TimerId,
}

struct Inner {
    looper: Arc<Looper>,
    server_addr: SocketAddr,
    client_addr: Mutex<Option<SocketAddr>>,
    /// (initial, maximum) retry delay in milliseconds.
    delays: Mutex<(i64, i64)>,
    connected_cb: Mutex<ConnectedCb>,
    state: Mutex<ConnectorState>,
}

impl TcpConnector {
    /// Creates a connector for `server_addr`.
    ///
    /// `client_addr`, when given, is bound before connecting. Retries
    /// start at `init_delay_ms` and double up to `max_delay_ms`.
    pub fn new(
        looper: &Arc<Looper>,
        server_addr: SocketAddr,
        client_addr: Option<SocketAddr>,
        init_delay_ms: i64,
        max_delay_ms: i64,
        connected_cb: impl FnMut(OwnedFd) + Send + 'static,
    ) -> Result<TcpConnector> {
        if init_delay_ms < 0 || max_delay_ms < 0 || init_delay_ms > max_delay_ms {
            return Err(Error::InvalidInput);
        }

        Ok(TcpConnector {
            inner: Arc::new(Inner {
                looper: Arc::clone(looper),
                server_addr,
                client_addr: Mutex::new(client_addr),
                delays: Mutex::new((init_delay_ms, max_delay_ms)),
                connected_cb: Mutex::new(Box::new(connected_cb)),
                state: Mutex::new(ConnectorState {
                    working: false,
                    phase: Phase::Idle,
                    fd: None,
                    channel: None,
                    cur_delay_ms: init_delay_ms,
                    retry_timer: TimerId::default(),
                }),
            }),
        })
    }

    /// The address this connector dials.
    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    /// Sets the local address bound before the next attempt.
    pub fn set_client_addr(&self, client_addr: Option<SocketAddr>) {
        *self.inner.client_addr.lock().unwrap() = client_addr;
    }

    /// Adjusts the retry delays; takes effect from the next `connect`.
    pub fn set_retry_delay(&self, init_delay_ms: i64, max_delay_ms: i64) -> Result<()> {
        if init_delay_ms < 0 || max_delay_ms < 0 || init_delay_ms > max_delay_ms {
            return Err(Error::InvalidInput);
        }
        *self.inner.delays.lock().unwrap() = (init_delay_ms, max_delay_ms);
        Ok(())
    }

    /// Starts connecting. Fails with [`Error::InProgress`] when an attempt
    /// is already underway.
    ///
    /// Off the loop thread the call is re-dispatched and reports success
    /// immediately.
    pub fn connect(&self) -> Result<()> {
        if !self.inner.looper.is_loop_thread() {
            let inner = Arc::clone(&self.inner);
            self.inner.looper.dispatch(move || {
                if let Err(err) = Inner::connect(&inner) {
                    warn!("connect to {} failed: {}", inner.server_addr, err);
                }
            });
            return Ok(());
        }
        Inner::connect(&self.inner)
    }

    /// Cancels the pending retry timer and resets the connector to idle.
    ///
    /// Fails with [`Error::NotRunning`] when nothing is underway.
    pub fn cancel(&self) -> Result<()> {
        if !self.inner.looper.is_loop_thread() {
            let inner = Arc::clone(&self.inner);
            self.inner.looper.dispatch(move || {
                let _ = Inner::cancel(&inner);
            });
            return Ok(());
        }
        Inner::cancel(&self.inner)
    }
}

impl Inner {
    fn connect(inner: &Arc<Inner>) -> Result<()> {
        {
            let mut state = inner.state.lock().unwrap();
            if state.working {
                return Err(Error::InProgress);
            }
            inner.reset_locked(&mut state);
            state.working = true;
        }
        Inner::try_connect(inner)
    }

    fn cancel(inner: &Arc<Inner>) -> Result<()> {
        let mut state = inner.state.lock().unwrap();
        if !state.working {
            return Err(Error::NotRunning);
        }
        inner.looper.cancel(state.retry_timer);
        inner.reset_locked(&mut state);
        Ok(())
    }

    fn reset_locked(&self, state: &mut ConnectorState) {
        state.working = false;
        state.phase = Phase::Idle;
        state.cur_delay_ms = self.delays.lock().unwrap().0;
        state.retry_timer = TimerId::default();
        if let Some(channel) = state.channel.take() {
            channel.detach();
        }
        state.fd = None;
    }

    /// One connect attempt. Runs on the loop thread.
    fn try_connect(inner: &Arc<Inner>) -> Result<()> {
        let res = Inner::try_connect_inner(inner);
        if let Err(ref err) = res {
            warn!("connect attempt to {} failed: {}", inner.server_addr, err);
            let mut state = inner.state.lock().unwrap();
            inner.reset_locked(&mut state);
        }
        res
    }

    fn try_connect_inner(inner: &Arc<Inner>) -> Result<()> {
        let fd = sock::new_tcp_socket(&inner.server_addr)?;
        let raw_fd = fd.as_raw_fd();

        if let Some(client_addr) = *inner.client_addr.lock().unwrap() {
            // A fixed client port needs SO_REUSEADDR to survive TIME_WAIT.
            if !addr::is_port_unspecified(&client_addr) {
                sock::set_reuseaddr(raw_fd, true)?;
            }
            if !addr::is_ip_unspecified(&client_addr) || !addr::is_port_unspecified(&client_addr) {
                sock::bind(raw_fd, &client_addr)?;
            }
        }

        let code = match sock::connect(raw_fd, &inner.server_addr) {
            Ok(()) => 0,
            Err(err) => err.raw_os_error().unwrap_or(-1),
        };

        match code {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => {
                // In flight; the probe channel's write readiness settles it.
                let mut state = inner.state.lock().unwrap();
                state.phase = Phase::Connecting;
                let channel = Channel::new(&inner.looper, raw_fd, Ready::WRITABLE)?;
                let weak = Arc::downgrade(inner);
                channel.set_write_callback(Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        Inner::handle_write(&inner);
                    }
                }));
                state.fd = Some(fd);
                state.channel = Some(channel);
                Ok(())
            }
            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH
            | libc::ETIMEDOUT
            | libc::ENOBUFS => {
                trace!(
                    "transient connect failure to {} (errno {})",
                    inner.server_addr,
                    code
                );
                drop(fd);
                Inner::retry(inner)
            }
            _ => Err(io::Error::from_raw_os_error(code).into()),
        }
    }

    /// Write readiness on the probe: the connect has settled one way or
    /// the other.
    fn handle_write(inner: &Arc<Inner>) {
        let fd = {
            let mut state = inner.state.lock().unwrap();
            if !state.working || state.phase != Phase::Connecting {
                inner.reset_locked(&mut state);
                return;
            }
            // The probe channel has served its purpose; detach it so the
            // fd can be re-registered by whoever takes it over.
            if let Some(channel) = state.channel.take() {
                channel.detach();
            }
            match state.fd.take() {
                Some(fd) => fd,
                None => {
                    drop(state);
                    let _ = Inner::retry(inner);
                    return;
                }
            }
        };

        match sock::take_socket_error(fd.as_raw_fd()) {
            Ok(None) => {}
            Ok(Some(err)) => {
                trace!("connect to {} refused: {}", inner.server_addr, err);
                drop(fd);
                let _ = Inner::retry(inner);
                return;
            }
            Err(err) => {
                warn!("SO_ERROR check failed: {}", err);
                drop(fd);
                let _ = Inner::retry(inner);
                return;
            }
        }

        // A self-connection looks established but is useless; retry on a
        // fresh ephemeral port.
        match addr::local_addr(fd.as_raw_fd()) {
            Ok(local) if addr::sockaddr_eq(&local, &inner.server_addr) => {
                trace!("detected TCP self-connection to {}", inner.server_addr);
                drop(fd);
                let _ = Inner::retry(inner);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("getsockname failed on connect probe: {}", err);
                drop(fd);
                let _ = Inner::retry(inner);
                return;
            }
        }

        {
            let mut state = inner.state.lock().unwrap();
            state.phase = Phase::Connected;
            state.working = false;
        }
        (inner.connected_cb.lock().unwrap())(fd);
    }

    /// Schedules the next attempt `cur_delay` from now and doubles the
    /// delay, capped at the maximum.
    fn retry(inner: &Arc<Inner>) -> Result<()> {
        let delay_ms = {
            let mut state = inner.state.lock().unwrap();
            if !state.working {
                inner.reset_locked(&mut state);
                return Ok(());
            }
            state.phase = Phase::Idle;
            state.retry_timer = TimerId::default();
            if let Some(channel) = state.channel.take() {
                channel.detach();
            }
            state.fd = None;
            state.cur_delay_ms
        };

        let weak = Arc::downgrade(inner);
        let timer = inner.looper.run_after(delay_ms, move || {
            if let Some(inner) = weak.upgrade() {
                let _ = Inner::try_connect(&inner);
            }
        })?;

        let mut state = inner.state.lock().unwrap();
        state.retry_timer = timer;
        let (_, max_delay_ms) = *inner.delays.lock().unwrap();
        if state.cur_delay_ms < max_delay_ms {
            state.cur_delay_ms = (state.cur_delay_ms * 2).min(max_delay_ms);
        }
        Ok(())
    }
}

impl fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("TcpConnector")
            .field("server_addr", &self.inner.server_addr)
            .field("working", &state.working)
            .field("phase", &state.phase)
            .finish()
    }
}
