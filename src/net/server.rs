use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, warn};

use super::connection::ConnectionConfig;
use super::{addr, sock, TcpAcceptor, TcpCallbacks, TcpConnection};
use crate::{Circlebuf, Error, Looper, Result};

/// A multi-loop TCP server.
///
/// One or more listeners accept on the main looper; each accepted fd is
/// wrapped in a [`TcpConnection`] bound either to the main looper or, with
/// [`set_io_loopers_num`], to one of a pool of I/O looper threads chosen
/// round-robin. The live-connections set belongs to the main looper; I/O
/// loopers reach it only through the dispatch queue.
///
/// Configuration (buffer bounds, water mark, keepalive, reuse-port,
/// callbacks) applies to connections accepted afterwards; set everything
/// up before [`start`].
///
/// [`set_io_loopers_num`]: TcpServer::set_io_loopers_num
/// [`start`]: TcpServer::start
pub struct TcpServer {
    inner: Arc<Inner>,
}

// A clone is another handle to the same server.
impl Clone for TcpServer {
    fn clone(&self) -> TcpServer {
        TcpServer {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Listener {
    listen_addr: SocketAddr,
    acceptor: TcpAcceptor,
}

#[derive(Default)]
struct Pool {
    num: usize,
    loopers: Vec<Arc<Looper>>,
    threads: Vec<thread::JoinHandle<()>>,
    next: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Keepalive {
    idle_s: u32,
    intvl_s: u32,
    cnt: u32,
}

struct Inner {
    looper: Arc<Looper>,
    listeners: Mutex<Vec<Listener>>,
    conns: Mutex<HashMap<u64, Arc<TcpConnection>>>,
    pool: Mutex<Pool>,
    config: Mutex<ConnectionConfig>,
    keepalive: Mutex<Keepalive>,
    reuse_port: Mutex<bool>,
    callbacks: Mutex<TcpCallbacks>,
    next_conn_id: AtomicU64,
}

impl TcpServer {
    /// Creates a server with one listener on `listen_addr`, accepting on
    /// `looper` (the main looper).
    pub fn new(looper: &Arc<Looper>, listen_addr: SocketAddr) -> Result<TcpServer> {
        let server = TcpServer {
            inner: Arc::new(Inner {
                looper: Arc::clone(looper),
                listeners: Mutex::new(Vec::new()),
                conns: Mutex::new(HashMap::new()),
                pool: Mutex::new(Pool::default()),
                config: Mutex::new(ConnectionConfig::default()),
                keepalive: Mutex::new(Keepalive::default()),
                reuse_port: Mutex::new(false),
                callbacks: Mutex::new(TcpCallbacks::default()),
                next_conn_id: AtomicU64::new(0),
            }),
        };
        server.add_listener(listen_addr)?;
        Ok(server)
    }

    /// Adds another listen address. Duplicates are rejected.
    pub fn add_listener(&self, listen_addr: SocketAddr) -> Result<()> {
        let inner = &self.inner;
        let mut listeners = inner.listeners.lock().unwrap();

        if listeners
            .iter()
            .any(|l| addr::sockaddr_eq(&l.listen_addr, &listen_addr))
        {
            warn!(
                "duplicate listen address {}",
                addr::format_addr(&listen_addr)
            );
            return Err(Error::Duplicate);
        }

        let weak = Arc::downgrade(inner);
        let acceptor = TcpAcceptor::new(&inner.looper, listen_addr, move |fd| {
            if let Some(inner) = weak.upgrade() {
                Inner::handle_accepted(&inner, fd);
            }
        })?;

        listeners.push(Listener {
            listen_addr,
            acceptor,
        });
        Ok(())
    }

    /// Sets the size of the I/O looper pool.
    ///
    /// 0 (the default) keeps all I/O on the main looper; `n >= 1` starts
    /// `n` dedicated threads at [`start`], and accepted connections are
    /// assigned round-robin.
    ///
    /// [`start`]: TcpServer::start
    pub fn set_io_loopers_num(&self, num: usize) {
        self.inner.pool.lock().unwrap().num = num;
    }

    /// Enables TCP keepalive on accepted sockets.
    ///
    /// `idle_s == 0` (the default) leaves keepalive off.
    pub fn set_keepalive(&self, idle_s: u32, intvl_s: u32, cnt: u32) {
        *self.inner.keepalive.lock().unwrap() = Keepalive {
            idle_s,
            intvl_s,
            cnt,
        };
    }

    /// Sets `SO_REUSEPORT` on the listeners started afterwards.
    pub fn set_reuseport(&self, on: bool) {
        *self.inner.reuse_port.lock().unwrap() = on;
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

    /// Starts the I/O looper pool (if configured) and all listeners.
    ///
    /// Off the main looper thread the call is re-dispatched and reports
    /// success immediately.
    pub fn start(&self) -> Result<()> {
        if !self.inner.looper.is_loop_thread() {
            let inner = Arc::clone(&self.inner);
            self.inner.looper.dispatch(move || {
                if let Err(err) = Inner::start(&inner) {
                    error!("server start failed: {}", err);
                }
            });
            return Ok(());
        }
        Inner::start(&self.inner)
    }

    /// Stops the listeners, closes every live connection, then quits and
    /// joins the I/O looper pool.
    ///
    /// Off the main looper thread the call is re-dispatched and reports
    /// success immediately.
    pub fn stop(&self) -> Result<()> {
        if !self.inner.looper.is_loop_thread() {
            let inner = Arc::clone(&self.inner);
            self.inner.looper.dispatch(move || {
                Inner::stop(&inner);
            });
            return Ok(());
        }
        Inner::stop(&self.inner);
        Ok(())
    }

    /// Number of currently live connections.
    pub fn connections(&self) -> usize {
        self.inner.conns.lock().unwrap().len()
    }
}

impl Inner {
    fn start(inner: &Arc<Inner>) -> Result<()> {
        {
            let mut pool = inner.pool.lock().unwrap();
            let num = pool.num;
            pool.next = 0;

            for i in 0..num {
                let looper = match Looper::new() {
                    Ok(looper) => looper,
                    Err(err) => {
                        Inner::stop_pool(&mut pool);
                        return Err(err);
                    }
                };
                let thread_looper = Arc::clone(&looper);
                let res = thread::Builder::new()
                    .name(format!("evio-io-{}", i))
                    .spawn(move || {
                        if let Err(err) = thread_looper.run() {
                            error!("io looper exited with error: {}", err);
                        }
                    });
                match res {
                    Ok(handle) => {
                        pool.loopers.push(looper);
                        pool.threads.push(handle);
                    }
                    Err(err) => {
                        Inner::stop_pool(&mut pool);
                        return Err(err.into());
                    }
                }
            }
        }

        let reuse_port = *inner.reuse_port.lock().unwrap();
        let listeners = inner.listeners.lock().unwrap();
        for listener in listeners.iter() {
            if let Err(err) = listener.acceptor.start(reuse_port) {
                for started in listeners.iter() {
                    started.acceptor.stop();
                }
                let mut pool = inner.pool.lock().unwrap();
                Inner::stop_pool(&mut pool);
                return Err(err);
            }
        }
        Ok(())
    }

    fn stop(inner: &Arc<Inner>) {
        for listener in inner.listeners.lock().unwrap().iter() {
            listener.acceptor.stop();
        }

        // Close every live connection; the closes land on the owning
        // loopers' queues and the final pending drain of each looper runs
        // them even when quit arrives first.
        let conns = std::mem::take(&mut *inner.conns.lock().unwrap());
        for conn in conns.values() {
            conn.close();
        }
        drop(conns);

        let mut pool = inner.pool.lock().unwrap();
        Inner::stop_pool(&mut pool);
    }

    fn stop_pool(pool: &mut Pool) {
        for looper in &pool.loopers {
            looper.quit();
        }
        for thread in pool.threads.drain(..) {
            if thread.join().is_err() {
                error!("io looper thread panicked");
            }
        }
        pool.loopers.clear();
        pool.next = 0;
    }

    /// Runs on the main looper for every accepted fd.
    fn handle_accepted(inner: &Arc<Inner>, fd: OwnedFd) {
        let looper = {
            let mut pool = inner.pool.lock().unwrap();
            if pool.loopers.is_empty() {
                Arc::clone(&inner.looper)
            } else {
                let looper = Arc::clone(&pool.loopers[pool.next]);
                pool.next = (pool.next + 1) % pool.loopers.len();
                looper
            }
        };

        let keepalive = *inner.keepalive.lock().unwrap();
        if keepalive.idle_s > 0 {
            if let Err(err) = sock::set_keepalive(
                fd.as_raw_fd(),
                keepalive.idle_s,
                keepalive.intvl_s,
                keepalive.cnt,
            ) {
                error!("enabling keepalive on accepted fd failed: {}", err);
                return;
            }
        }

        let id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let config = *inner.config.lock().unwrap();
        let callbacks = inner.callbacks.lock().unwrap().clone();
        let weak = Arc::downgrade(inner);
        let remove_cb = Box::new(move |conn: &Arc<TcpConnection>| {
            if let Some(inner) = weak.upgrade() {
                Inner::handle_remove(&inner, conn);
            }
        });

        let conn = match TcpConnection::new(&looper, fd, &config, callbacks, remove_cb, id) {
            Ok(conn) => conn,
            Err(err) => {
                error!("failed to wrap accepted socket: {}", err);
                return;
            }
        };

        inner.conns.lock().unwrap().insert(id, Arc::clone(&conn));

        if let Err(err) = conn.start() {
            error!("failed to start accepted connection: {}", err);
            inner.conns.lock().unwrap().remove(&id);
        }
    }

    /// Always lands on the main looper; connections on pool loopers get
    /// here through a dispatch.
    fn handle_remove(inner: &Arc<Inner>, conn: &Arc<TcpConnection>) {
        if inner.looper.is_loop_thread() {
            inner.conns.lock().unwrap().remove(&conn.id());
        } else {
            let inner = Arc::clone(inner);
            let conn = Arc::clone(conn);
            let looper = Arc::clone(&inner.looper);
            looper.dispatch(move || {
                inner.conns.lock().unwrap().remove(&conn.id());
            });
        }
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("listeners", &self.inner.listeners.lock().unwrap().len())
            .field("connections", &self.inner.conns.lock().unwrap().len())
            .finish()
    }
}
