//! Reactor-style non-blocking TCP networking.
//!
//! evio builds single-thread-per-loop network services out of a small set of
//! cooperating parts:
//!
//! * [`Looper`] — an event loop bound to one OS thread, driving readiness
//!   dispatch, a millisecond timer index and a cross-thread task queue.
//! * [`Channel`] — the binding of a file descriptor and an interest set to
//!   one looper, with read/write callbacks.
//! * `Poller` — the readiness backend behind every looper: epoll where
//!   available, falling back to poll(2) and select(2), all behind one
//!   contract.
//! * [`Circlebuf`] — a bounded, growable circular byte buffer powering the
//!   connection read/write buffers.
//! * [`net`] — the TCP stack: acceptor, auto-retrying connector, buffered
//!   connection, multi-loop server and client.
//!
//! All cross-thread interaction funnels through [`Looper::dispatch`]; every
//! other operation on a looper's channels, timers and connections happens on
//! the thread driving that looper. Types are `Send + Sync` and shared via
//! `Arc`, so handing a connection to another thread is cheap; the methods
//! themselves re-dispatch onto the owning loop when called from outside it.
//!
//! # Example
//!
//! A ping-pong echo server on a single loop:
//!
//! ```no_run
//! use std::sync::Arc;
//! use evio::{Looper, net::TcpServer};
//!
//! # fn main() -> evio::Result<()> {
//! let looper = Looper::new()?;
//! let server = TcpServer::new(&looper, "127.0.0.1:9000".parse().unwrap())?;
//! server.set_read_cb(|conn, buf| {
//!     let mut data = vec![0; buf.len()];
//!     buf.get(&mut data).unwrap();
//!     let _ = conn.write(&data);
//! });
//! server.start()?;
//! looper.run()?;
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]
#![deny(missing_debug_implementations)]

/// Helper macro to execute a system call that returns an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod channel;
mod circlebuf;
mod error;
mod looper;
mod notifier;
mod poller;
mod ready;

pub mod net;

pub use channel::Channel;
pub use circlebuf::Circlebuf;
pub use error::{Error, Result};
pub use looper::{Looper, TimerId};
pub use notifier::Notifier;
pub use poller::{set_fixed_backend, Backend};
pub use ready::Ready;
