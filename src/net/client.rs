use std::fmt;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex, Weak};

use log::{error, warn};

use super::connection::ConnectionConfig;
use super::{TcpCallbacks, TcpConnection, TcpConnector};
use crate::{Circlebuf, Error, Looper, Result};

const DEFAULT_RETRY_INIT_DELAY_MS: i64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: i64 = 10 * 1000;

/// A TCP client: one auto-retrying connector and at most one live
/// connection.
///
/// Callbacks installed on the client are mirrored onto whichever
/// connection is currently alive. `connect`, `disconnect`, `reconnect`
/// and `cancel` may be called from any thread; they re-dispatch onto the
/// looper thread.
pub struct TcpClient {
    inner: Arc<Inner>,
}

// A clone is another handle to the same client.
impl Clone for TcpClient {
    fn clone(&self) -> TcpClient {
        TcpClient {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner {
    looper: Arc<Looper>,
    server_addr: SocketAddr,
    connector: TcpConnector,
    conn: Mutex<Option<Arc<TcpConnection>>>,
    config: Mutex<ConnectionConfig>,
    callbacks: Mutex<TcpCallbacks>,
}

impl TcpClient {
    /// Creates a client that will dial `server_addr`.
    pub fn new(looper: &Arc<Looper>, server_addr: SocketAddr) -> Result<TcpClient> {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let connected_cb = move |fd: OwnedFd| {
                if let Some(inner) = weak.upgrade() {
                    Inner::handle_connected(&inner, fd);
                }
            };
            // The connector is infallible to build once its arguments are
            // valid, and these constants are.
            let connector = TcpConnector::new(
                looper,
                server_addr,
                None,
                DEFAULT_RETRY_INIT_DELAY_MS,
                DEFAULT_RETRY_MAX_DELAY_MS,
                connected_cb,
            )
            .expect("default connector delays are valid");

            Inner {
                looper: Arc::clone(looper),
                server_addr,
                connector,
                conn: Mutex::new(None),
                config: Mutex::new(ConnectionConfig::default()),
                callbacks: Mutex::new(TcpCallbacks::default()),
            }
        });

        Ok(TcpClient { inner })
    }

    /// The address this client dials.
    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.inner.conn.lock().unwrap().clone()
    }

    /// Binds the local side to `client_addr` before connecting.
    pub fn set_client_addr(&self, client_addr: SocketAddr) {
        self.inner.connector.set_client_addr(Some(client_addr));
    }

    /// Adjusts the reconnect backoff delays.
    pub fn set_reconnect_delay(&self, init_delay_ms: i64, max_delay_ms: i64) -> Result<()> {
        self.inner.connector.set_retry_delay(init_delay_ms, max_delay_ms)
    }

    /// Sets the read buffer bounds for future connections.
    pub fn set_read_buf_len(&self, min_len: usize, max_len: usize) -> Result<()> {
        if min_len == 0 || max_len == 0 || min_len > max_len {
            return Err(Error::InvalidInput);
        }
        let mut config = self.inner.config.lock().unwrap();
        config.read_buf_min = min_len;
        config.read_buf_max = max_len;
        Ok(())
    }

    /// Sets the write buffer's initial capacity for future connections.
    pub fn set_write_buf_len(&self, min_len: usize) -> Result<()> {
        if min_len == 0 {
            return Err(Error::InvalidInput);
        }
        self.inner.config.lock().unwrap().write_buf_min = min_len;
        Ok(())
    }

    /// Installs the connection-established callback.
    pub fn set_established_cb(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().established = Some(Arc::new(cb));
    }

    /// Installs the read callback.
    pub fn set_read_cb(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Circlebuf) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().read = Some(Arc::new(cb));
    }

    /// Installs the write-completed callback.
    pub fn set_write_completed_cb(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().write_completed = Some(Arc::new(cb));
    }

    /// Installs the high-water-mark callback and the mark itself.
    pub fn set_high_water_mark_cb(
        &self,
        high_water_mark: usize,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
    ) -> Result<()> {
        if high_water_mark == 0 {
            return Err(Error::InvalidInput);
        }
        self.inner.callbacks.lock().unwrap().high_water_mark = Some(Arc::new(cb));
        self.inner.config.lock().unwrap().high_water_mark = high_water_mark;
        Ok(())
    }

    /// Installs the connection-closed callback.
    pub fn set_closed_cb(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.inner.callbacks.lock().unwrap().closed = Some(Arc::new(cb));
    }

    /// Starts connecting (with backoff retry until it succeeds or is
    /// cancelled).
    pub fn connect(&self) -> Result<()> {
        self.inner.connector.connect()
    }

    /// Cancels a pending connect attempt.
    pub fn cancel(&self) -> Result<()> {
        self.inner.connector.cancel()
    }

    /// Cancels any connect attempt and closes the live connection.
    pub fn disconnect(&self) -> Result<()> {
        if !self.inner.looper.is_loop_thread() {
            let inner = Arc::clone(&self.inner);
            self.inner.looper.dispatch(move || {
                if let Err(err) = Inner::disconnect(&inner) {
                    warn!("disconnect from {} failed: {}", inner.server_addr, err);
                }
            });
            return Ok(());
        }
        Inner::disconnect(&self.inner)
    }

    /// Drops whatever exists (attempt or connection) and connects again.
    pub fn reconnect(&self) -> Result<()> {
        if !self.inner.looper.is_loop_thread() {
            let inner = Arc::clone(&self.inner);
            self.inner.looper.dispatch(move || {
                if let Err(err) = Inner::reconnect(&inner) {
                    warn!("reconnect to {} failed: {}", inner.server_addr, err);
                }
            });
            return Ok(());
        }
        Inner::reconnect(&self.inner)
    }
}

impl Inner {
    fn disconnect(inner: &Arc<Inner>) -> Result<()> {
        // The connector may legitimately be idle here.
        match inner.connector.cancel() {
            Ok(()) | Err(Error::NotRunning) => {}
            Err(err) => return Err(err),
        }
        if let Some(conn) = inner.conn.lock().unwrap().clone() {
            conn.close();
        }
        Ok(())
    }

    fn reconnect(inner: &Arc<Inner>) -> Result<()> {
        Inner::disconnect(inner)?;
        inner.connector.connect()
    }

    fn handle_connected(inner: &Arc<Inner>, fd: OwnedFd) {
        {
            let mut conn = inner.conn.lock().unwrap();
            if let Some(old) = conn.take() {
                error!("connector delivered a socket while a connection is live");
                old.close();
            }
        }

        let config = *inner.config.lock().unwrap();
        let callbacks = inner.callbacks.lock().unwrap().clone();
        let weak = Arc::downgrade(inner);
        let remove_cb = Box::new(move |conn: &Arc<TcpConnection>| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_remove(conn);
            }
        });

        let conn = match TcpConnection::new(&inner.looper, fd, &config, callbacks, remove_cb, 0) {
            Ok(conn) => conn,
            Err(err) => {
                error!("failed to wrap connected socket: {}", err);
                return;
            }
        };

        *inner.conn.lock().unwrap() = Some(Arc::clone(&conn));

        if let Err(err) = conn.start() {
            error!("failed to start client connection: {}", err);
            inner.conn.lock().unwrap().take();
        }
    }

    fn handle_remove(&self, conn: &Arc<TcpConnection>) {
        let mut slot = self.conn.lock().unwrap();
        if let Some(current) = &*slot {
            if Arc::ptr_eq(current, conn) {
                slot.take();
            }
        }
    }
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("server_addr", &self.inner.server_addr)
            .field("connected", &self.inner.conn.lock().unwrap().is_some())
            .finish()
    }
}
