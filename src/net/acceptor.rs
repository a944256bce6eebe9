use std::ffi::CStr;
use std::fmt;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use log::error;

use super::sock;
use crate::{Channel, Looper, Ready, Result};

type AcceptedCb = Box<dyn FnMut(OwnedFd) + Send>;

/// A listening socket feeding accepted fds to a callback.
///
/// The listen fd is non-blocking and accepted in a loop until `EAGAIN`;
/// each accepted fd arrives at the callback already non-blocking and
/// close-on-exec. A persistent idle fd on `/dev/null` covers fd
/// exhaustion: on `EMFILE`/`ENFILE` the idle fd is closed, the pending
/// connection accepted and immediately dropped, and the idle fd reopened,
/// so the listen queue cannot wedge.
pub struct TcpAcceptor {
    inner: Arc<Inner>,
}

struct Listening {
    // Declaration order doubles as teardown order: interest is cleared
    // while the fd is still open.
    channel: Arc<Channel>,
    fd: OwnedFd,
}

struct Inner {
    looper: Arc<Looper>,
    listen_addr: SocketAddr,
    listening: Mutex<Option<Listening>>,
    idle_fd: Mutex<Option<OwnedFd>>,
    accepted_cb: Mutex<AcceptedCb>,
}

fn open_idle_fd() -> Result<OwnedFd> {
    let path = CStr::from_bytes_with_nul(b"/dev/null\0").unwrap();
    let fd = syscall!(open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC))?;
    // SAFETY: `open(2)` ensures the fd is valid.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl TcpAcceptor {
    /// Creates an acceptor for `listen_addr`; nothing listens until
    /// [`start`].
    ///
    /// [`start`]: TcpAcceptor::start
    pub fn new(
        looper: &Arc<Looper>,
        listen_addr: SocketAddr,
        accepted_cb: impl FnMut(OwnedFd) + Send + 'static,
    ) -> Result<TcpAcceptor> {
        let idle_fd = open_idle_fd()?;
        Ok(TcpAcceptor {
            inner: Arc::new(Inner {
                looper: Arc::clone(looper),
                listen_addr,
                listening: Mutex::new(None),
                idle_fd: Mutex::new(Some(idle_fd)),
                accepted_cb: Mutex::new(Box::new(accepted_cb)),
            }),
        })
    }

    /// The address this acceptor listens (or will listen) on.
    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Binds, listens and registers read interest on the looper.
    ///
    /// `SO_REUSEADDR` is always set, `SO_REUSEPORT` as requested, and an
    /// IPv6 listener always accepts IPv4-mapped peers. A started acceptor
    /// is stopped and restarted.
    pub fn start(&self, reuse_port: bool) -> Result<()> {
        let inner = &self.inner;
        if inner.listening.lock().unwrap().is_some() {
            self.stop();
        }

        let fd = sock::new_tcp_socket(&inner.listen_addr)?;
        let raw_fd = fd.as_raw_fd();
        let res = (|| -> Result<Arc<Channel>> {
            sock::set_reuseaddr(raw_fd, true)?;
            sock::set_reuseport(raw_fd, reuse_port)?;
            if inner.listen_addr.is_ipv6() {
                sock::set_v6only(raw_fd, false)?;
            }
            sock::bind(raw_fd, &inner.listen_addr)?;
            sock::listen(raw_fd)?;

            let channel = Channel::new(&inner.looper, raw_fd, Ready::READABLE)?;
            let weak = Arc::downgrade(inner);
            channel.set_read_callback(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_read();
                }
            }));
            Ok(channel)
        })();

        match res {
            Ok(channel) => {
                *inner.listening.lock().unwrap() = Some(Listening { channel, fd });
                Ok(())
            }
            Err(err) => {
                self.stop();
                Err(err)
            }
        }
    }

    /// Stops listening and closes the listen fd. Idempotent.
    pub fn stop(&self) {
        self.inner.listening.lock().unwrap().take();
    }
}

impl Inner {
    fn handle_read(&self) {
        let listen_fd = match &*self.listening.lock().unwrap() {
            Some(listening) => listening.fd.as_raw_fd(),
            None => return,
        };

        loop {
            match sock::accept(listen_fd) {
                Ok(fd) => {
                    (self.accepted_cb.lock().unwrap())(fd);
                }
                Err(err) => match err.raw_os_error() {
                    Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => break,
                    Some(code)
                        if code == libc::EINTR
                            || code == libc::ECONNABORTED
                            || code == libc::EPROTO =>
                    {
                        continue
                    }
                    Some(code) if code == libc::EMFILE || code == libc::ENFILE => {
                        // Out of fds: sacrifice the idle fd, shed the
                        // pending connection, then re-arm.
                        let mut idle = self.idle_fd.lock().unwrap();
                        idle.take();
                        let _ = sock::accept(listen_fd);
                        match open_idle_fd() {
                            Ok(fd) => *idle = Some(fd),
                            Err(err) => error!("reopening the idle fd failed: {}", err),
                        }
                        break;
                    }
                    _ => {
                        error!("accept(2) failed on fd {}: {}", listen_fd, err);
                        break;
                    }
                },
            }
        }
    }
}

impl fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("listen_addr", &self.inner.listen_addr)
            .field("listening", &self.inner.listening.lock().unwrap().is_some())
            .finish()
    }
}
