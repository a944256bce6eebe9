// Not all functions are used by all tests.
#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use evio::Looper;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    })
}

pub fn assert_sync<T: Sync>() {}
pub fn assert_send<T: Send>() {}

/// Starts a looper on a fresh thread and waits until that thread is
/// actually driving it.
pub fn start_looper() -> (Arc<Looper>, thread::JoinHandle<()>) {
    init();

    let looper = Looper::new().expect("unable to create looper");
    let thread_looper = Arc::clone(&looper);
    let handle = thread::spawn(move || {
        thread_looper.run().expect("looper failed");
    });
    barrier(&looper);
    (looper, handle)
}

pub fn stop_looper(looper: Arc<Looper>, handle: thread::JoinHandle<()>) {
    looper.quit();
    handle.join().expect("looper thread panicked");
}

/// Round-trips a task through the looper's pending queue; when this
/// returns, everything dispatched before it has run.
pub fn barrier(looper: &Arc<Looper>) {
    let (tx, rx) = mpsc::channel();
    looper.dispatch(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("looper did not process the barrier task");
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
