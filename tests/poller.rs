use std::net::UdpSocket;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use evio::{set_fixed_backend, Backend, Channel, Looper, Ready};

mod util;

use util::init;

/// The backend override is process-wide; looper creation under a pinned
/// backend must be serialized across tests.
static BACKEND_LOCK: Mutex<()> = Mutex::new(());

fn looper_with_backend(backend: Backend) -> Arc<Looper> {
    init();
    let guard = BACKEND_LOCK.lock().unwrap_or_else(|err| err.into_inner());
    set_fixed_backend(Some(backend));
    let looper = Looper::new().expect("unable to create looper");
    set_fixed_backend(None);
    drop(guard);
    assert_eq!(looper.backend(), backend);
    looper
}

/// Registers `sockets` read channels, pokes the socket at `poke`, runs the
/// loop until that callback quits it.
fn readiness_smoke(looper: Arc<Looper>, sockets: usize, poke: usize) {
    let mut socks = Vec::new();
    let mut channels = Vec::new();
    let hits = Arc::new(AtomicUsize::new(0));

    for _ in 0..sockets {
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
        sock.set_nonblocking(true).unwrap();

        let channel = Channel::new(&looper, sock.as_raw_fd(), Ready::READABLE).unwrap();
        let sock2 = Arc::clone(&sock);
        let hits2 = Arc::clone(&hits);
        let looper2 = Arc::clone(&looper);
        channel.set_read_callback(Box::new(move || {
            let mut buf = [0u8; 16];
            while sock2.recv_from(&mut buf).is_ok() {}
            hits2.fetch_add(1, Ordering::Relaxed);
            looper2.quit();
        }));

        socks.push(sock);
        channels.push(channel);
    }

    let target = socks[poke].local_addr().unwrap();
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"ping", target).unwrap();

    looper.run().unwrap();
    assert!(hits.load(Ordering::Relaxed) >= 1);

    drop(channels);
}

#[test]
#[cfg(any(target_os = "linux", target_os = "android"))]
fn epoll_dispatches_readiness() {
    let looper = looper_with_backend(Backend::Epoll);
    readiness_smoke(looper, 8, 7);
}

#[test]
fn poll_dispatches_readiness() {
    let looper = looper_with_backend(Backend::Poll);
    readiness_smoke(looper, 8, 3);
}

#[test]
fn select_dispatches_readiness() {
    let looper = looper_with_backend(Backend::Select);
    readiness_smoke(looper, 5, 0);
}

#[test]
fn poll_backend_grows_at_boundary() {
    // The poll backend starts with 64 slots and the looper's internal
    // notifier takes the first. 64 more channels force the array to
    // double exactly once, with the 64th landing in slot 64, the first
    // slot of the new half. Poking that socket proves the grown slot's
    // cookie still routes events correctly.
    let looper = looper_with_backend(Backend::Poll);
    readiness_smoke(looper, 64, 63);
}

#[test]
fn deleted_interest_stops_dispatch() {
    init();

    let looper = Looper::new().unwrap();
    let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
    sock.set_nonblocking(true).unwrap();

    let channel = Channel::new(&looper, sock.as_raw_fd(), Ready::READABLE).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    channel.set_read_callback(Box::new(move || {
        hits2.fetch_add(1, Ordering::Relaxed);
    }));

    channel.del_events(Ready::READABLE).unwrap();
    assert_eq!(channel.events(), Ready::NONE);

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(b"ping", sock.local_addr().unwrap()).unwrap();

    // Give the loop a cycle or two, then stop.
    let quit_looper = Arc::clone(&looper);
    looper
        .run_after(200, move || quit_looper.quit())
        .unwrap();
    looper.run().unwrap();

    assert_eq!(hits.load(Ordering::Relaxed), 0);
}

#[test]
fn write_interest_reports_writable() {
    init();

    let looper = Looper::new().unwrap();
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_nonblocking(true).unwrap();

    // A fresh UDP socket is immediately writable.
    let channel = Channel::new(&looper, sock.as_raw_fd(), Ready::WRITABLE).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let looper2 = Arc::clone(&looper);
    channel.set_write_callback(Box::new(move || {
        hits2.fetch_add(1, Ordering::Relaxed);
        looper2.quit();
    }));

    looper.run().unwrap();
    assert!(hits.load(Ordering::Relaxed) >= 1);
}

#[test]
fn duplicate_registration_is_rejected() {
    init();

    let looper = Looper::new().unwrap();
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();

    let _first = Channel::new(&looper, sock.as_raw_fd(), Ready::READABLE).unwrap();
    assert!(matches!(
        Channel::new(&looper, sock.as_raw_fd(), Ready::READABLE),
        Err(evio::Error::Duplicate)
    ));
}
