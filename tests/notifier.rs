use std::sync::Arc;
use std::thread;
use std::time::Duration;

use evio::Notifier;

mod util;

use util::{assert_send, assert_sync, init, start_looper, stop_looper};

#[test]
fn is_send_and_sync() {
    assert_send::<Notifier>();
    assert_sync::<Notifier>();
}

#[test]
fn send_and_recv_do_not_block() {
    init();

    let notifier = Notifier::new().expect("unable to create notifier");

    // Tokens accumulate; a recv drains them all; a drained notifier can
    // be sent to again. None of this may block.
    for _ in 0..100 {
        notifier.send();
    }
    notifier.recv();
    notifier.recv();
    notifier.send();
    notifier.recv();
}

#[test]
fn send_from_many_threads() {
    init();

    let notifier = Arc::new(Notifier::new().expect("unable to create notifier"));

    let senders: Vec<_> = (0..8)
        .map(|_| {
            let notifier = Arc::clone(&notifier);
            thread::spawn(move || {
                for _ in 0..1000 {
                    notifier.send();
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().unwrap();
    }

    notifier.recv();
}

#[test]
fn wakeups_reach_a_parked_looper() {
    // A looper with no timers parks indefinitely in its poller; the
    // internal notifier is the only thing that gets a dispatched task
    // through. This exercises exactly that edge.
    let (looper, handle) = start_looper();

    thread::sleep(Duration::from_millis(50));

    let (tx, rx) = std::sync::mpsc::channel();
    looper.dispatch(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("wakeup never reached the looper");

    stop_looper(looper, handle);
}
