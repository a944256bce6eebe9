//! The TCP stack: acceptor, connector, connection, server and client.
//!
//! [`TcpServer`] composes one or more acceptors with a set of live
//! [`TcpConnection`]s and an optional pool of I/O loopers; [`TcpClient`]
//! composes a [`TcpConnector`] (non-blocking connect with exponential
//! backoff) with at most one connection. No framing is imposed anywhere:
//! connections deliver the raw byte stream through a [`Circlebuf`] and the
//! caller frames it.
//!
//! [`Circlebuf`]: crate::Circlebuf

pub mod addr;

mod acceptor;
mod client;
mod connection;
mod connector;
mod server;
mod sock;

pub use acceptor::TcpAcceptor;
pub use client::TcpClient;
pub use connection::{TcpCallbacks, TcpConnection};
pub use connector::TcpConnector;
pub use server::TcpServer;
