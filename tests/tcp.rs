use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use evio::net::TcpServer;
use evio::Error;

mod util;

use util::{barrier, start_looper, stop_looper, wait_for};

/// Grabs a port the OS considers free. Racy in principle, fine in tests.
fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn connect_retry(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(err) => {
                if Instant::now() >= deadline {
                    panic!("server never came up: {}", err);
                }
                thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

#[test]
fn echo_ping_pong_three_clients() {
    let (looper, handle) = start_looper();
    let addr = free_addr();

    let server = TcpServer::new(&looper, addr).unwrap();
    server.set_io_loopers_num(2);

    let established = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&established);
    server.set_established_cb(move |_conn| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    server.set_read_cb(|conn, buf| {
        let mut data = vec![0; buf.len()];
        buf.get(&mut data).unwrap();
        conn.write(&data).unwrap();
    });
    let counter = Arc::clone(&closed);
    server.set_closed_cb(move |_conn| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    server.start().unwrap();

    let clients: Vec<_> = (0..3)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = connect_retry(addr);
                for _ in 0..2 {
                    stream.write_all(b"hello").unwrap();
                    let mut reply = [0u8; 5];
                    stream.read_exact(&mut reply).unwrap();
                    assert_eq!(&reply, b"hello");
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || {
        closed.load(Ordering::Relaxed) == 3
    }));
    assert_eq!(established.load(Ordering::Relaxed), 3);
    assert!(wait_for(Duration::from_secs(5), || server.connections() == 0));

    server.stop().unwrap();
    barrier(&looper);
    stop_looper(looper, handle);
}

#[test]
fn callback_order_per_connection() {
    let (looper, handle) = start_looper();
    let addr = free_addr();

    let server = TcpServer::new(&looper, addr).unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));

    let ev = Arc::clone(&events);
    server.set_established_cb(move |_conn| ev.lock().unwrap().push("established"));
    let ev = Arc::clone(&events);
    server.set_read_cb(move |_conn, buf| {
        buf.erase_all();
        ev.lock().unwrap().push("read");
    });
    let ev = Arc::clone(&events);
    server.set_closed_cb(move |_conn| ev.lock().unwrap().push("closed"));

    server.start().unwrap();

    {
        let mut stream = connect_retry(addr);
        stream.write_all(b"some bytes").unwrap();
        // Give the server a moment to read before the FIN.
        thread::sleep(Duration::from_millis(100));
    }

    assert!(wait_for(Duration::from_secs(5), || {
        events.lock().unwrap().last() == Some(&"closed")
    }));

    let events = events.lock().unwrap();
    assert_eq!(events[0], "established");
    assert!(events.len() >= 3);
    assert!(events[1..events.len() - 1].iter().all(|e| *e == "read"));
    assert_eq!(events[events.len() - 1], "closed");
    assert_eq!(events.iter().filter(|e| **e == "closed").count(), 1);

    server.stop().unwrap();
    barrier(&looper);
    stop_looper(looper, handle);
}

#[test]
fn upload_crosses_high_water_mark_once() {
    const TOTAL: usize = 5 * 1024 * 1024;
    const CHUNK: usize = 64 * 1024;
    const MARK: usize = 4 * 1024 * 1024;

    let (looper, handle) = start_looper();
    let addr = free_addr();

    let server = TcpServer::new(&looper, addr).unwrap();
    server.set_read_cb(|conn, buf| {
        let mut data = vec![0; buf.len()];
        buf.get(&mut data).unwrap();
        conn.write(&data).unwrap();
    });

    let hwm_hits = Arc::new(AtomicUsize::new(0));
    let hwm_level = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&hwm_hits);
    let level = Arc::clone(&hwm_level);
    server
        .set_high_water_mark_cb(MARK, move |_conn, water_mark| {
            hits.fetch_add(1, Ordering::Relaxed);
            level.store(water_mark, Ordering::Relaxed);
        })
        .unwrap();

    let drained = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&drained);
    server.set_write_completed_cb(move |_conn| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    server.start().unwrap();

    let mut payload = vec![0u8; TOTAL];
    let mut rng = StdRng::seed_from_u64(0x5eed);
    rng.fill(payload.as_mut_slice());

    let mut stream = connect_retry(addr);
    // Push the whole payload before reading anything back, so the echo
    // piles up in the server's write buffer and crosses the mark.
    for chunk in payload.chunks(CHUNK) {
        stream.write_all(chunk).unwrap();
    }

    let mut echoed = vec![0u8; TOTAL];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(echoed, payload);
    drop(stream);

    assert!(wait_for(Duration::from_secs(5), || {
        hwm_hits.load(Ordering::Relaxed) == 1
    }));
    assert!(hwm_level.load(Ordering::Relaxed) >= MARK);
    assert!(wait_for(Duration::from_secs(5), || {
        drained.load(Ordering::Relaxed) >= 1
    }));

    server.stop().unwrap();
    barrier(&looper);
    stop_looper(looper, handle);
}

#[test]
fn server_half_close_drains_then_fins() {
    let (looper, handle) = start_looper();
    let addr = free_addr();

    let server = TcpServer::new(&looper, addr).unwrap();
    // Echo, then half-close: the reply must still arrive before the FIN.
    server.set_read_cb(|conn, buf| {
        let mut data = vec![0; buf.len()];
        buf.get(&mut data).unwrap();
        conn.write(&data).unwrap();
        conn.shutdown_wr().unwrap();
    });
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    server.set_closed_cb(move |_conn| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    server.start().unwrap();

    let mut stream = connect_retry(addr);
    stream.write_all(b"goodbye").unwrap();

    let mut reply = [0u8; 7];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"goodbye");

    // After the half-close the next read sees EOF.
    let mut rest = [0u8; 1];
    assert_eq!(stream.read(&mut rest).unwrap(), 0);

    // Our FIN completes the shutdown; the server connection closes.
    drop(stream);
    assert!(wait_for(Duration::from_secs(5), || {
        closed.load(Ordering::Relaxed) == 1
    }));

    server.stop().unwrap();
    barrier(&looper);
    stop_looper(looper, handle);
}

#[test]
fn duplicate_listen_addresses_are_rejected() {
    let (looper, handle) = start_looper();
    let addr = free_addr();

    let server = TcpServer::new(&looper, addr).unwrap();
    assert!(matches!(server.add_listener(addr), Err(Error::Duplicate)));

    stop_looper(looper, handle);
}

#[test]
fn multiple_listeners_accept_independently() {
    let (looper, handle) = start_looper();
    let addr1 = free_addr();
    let addr2 = free_addr();

    let server = TcpServer::new(&looper, addr1).unwrap();
    server.add_listener(addr2).unwrap();

    let established = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&established);
    server.set_established_cb(move |_conn| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    server.start().unwrap();

    let s1 = connect_retry(addr1);
    let s2 = connect_retry(addr2);
    assert!(wait_for(Duration::from_secs(5), || {
        established.load(Ordering::Relaxed) == 2
    }));
    drop(s1);
    drop(s2);

    server.stop().unwrap();
    barrier(&looper);
    stop_looper(looper, handle);
}

#[test]
fn stop_closes_live_connections() {
    let (looper, handle) = start_looper();
    let addr = free_addr();

    let server = TcpServer::new(&looper, addr).unwrap();
    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    server.set_closed_cb(move |_conn| {
        counter.fetch_add(1, Ordering::Relaxed);
    });
    server.start().unwrap();

    let mut stream = connect_retry(addr);
    assert!(wait_for(Duration::from_secs(5), || server.connections() == 1));

    server.stop().unwrap();
    barrier(&looper);

    assert!(wait_for(Duration::from_secs(5), || {
        closed.load(Ordering::Relaxed) == 1
    }));

    // The peer observes the close as EOF (or a reset).
    let mut buf = [0u8; 1];
    match stream.read(&mut buf) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {} bytes after server stop", n),
    }

    stop_looper(looper, handle);
}
