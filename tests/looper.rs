use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use evio::Looper;

mod util;

use util::{assert_send, assert_sync, barrier, init, start_looper, stop_looper, wait_for};

#[test]
fn is_send_and_sync() {
    assert_send::<Looper>();
    assert_sync::<Looper>();
}

#[test]
fn quit_stops_the_loop() {
    let (looper, handle) = start_looper();
    stop_looper(looper, handle);
}

#[test]
fn loop_thread_identity() {
    let (looper, handle) = start_looper();

    assert!(!looper.is_loop_thread());

    let (tx, rx) = mpsc::channel();
    let inner = Arc::clone(&looper);
    looper.dispatch(move || {
        let _ = tx.send(inner.is_loop_thread());
    });
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());

    stop_looper(looper, handle);
}

#[test]
fn dispatch_runs_in_enqueue_order() {
    let (looper, handle) = start_looper();

    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let seen = Arc::clone(&seen);
        looper.dispatch(move || seen.lock().unwrap().push(i));
    }
    barrier(&looper);

    assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());

    stop_looper(looper, handle);
}

#[test]
fn dispatch_from_many_threads() {
    const PRODUCERS: usize = 16;
    const PER_PRODUCER: usize = 1024;

    let (looper, handle) = start_looper();

    // Every task appends (producer, seq) on the loop thread.
    let seen: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let looper = Arc::clone(&looper);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let seen = Arc::clone(&seen);
                    looper.dispatch(move || seen.lock().unwrap().push((p, seq)));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    barrier(&looper);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), PRODUCERS * PER_PRODUCER);

    // Within one producer the sequence must be monotonic.
    let mut next = [0usize; PRODUCERS];
    for &(p, seq) in seen.iter() {
        assert_eq!(seq, next[p], "producer {} ran out of order", p);
        next[p] = seq + 1;
    }

    stop_looper(looper, handle);
}

#[test]
fn run_after_fires_no_earlier_than_asked() {
    let (looper, handle) = start_looper();

    let (tx, rx) = mpsc::channel();
    let begin = Instant::now();
    looper
        .run_after(200, move || {
            let _ = tx.send(begin.elapsed());
        })
        .unwrap();

    let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // Allow one millisecond of clock-rounding slack.
    assert!(
        elapsed >= Duration::from_millis(199),
        "fired after {:?}",
        elapsed
    );

    stop_looper(looper, handle);
}

#[test]
fn timers_fire_in_deadline_order() {
    let (looper, handle) = start_looper();

    let order = Arc::new(Mutex::new(Vec::new()));
    for (tag, delay) in [("b", 160), ("a", 80), ("c", 240)] {
        let order = Arc::clone(&order);
        looper
            .run_after(delay, move || order.lock().unwrap().push(tag))
            .unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || {
        order.lock().unwrap().len() == 3
    }));
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);

    stop_looper(looper, handle);
}

#[test]
fn periodic_fires_then_one_shots_in_order() {
    let (looper, handle) = start_looper();

    let events = Arc::new(Mutex::new(Vec::new()));

    let ev = Arc::clone(&events);
    looper
        .run_after(700, move || ev.lock().unwrap().push("a"))
        .unwrap();
    let ev = Arc::clone(&events);
    looper
        .run_after(1100, move || ev.lock().unwrap().push("b"))
        .unwrap();
    let ev = Arc::clone(&events);
    let periodic = looper
        .run_every(100, 100, move || ev.lock().unwrap().push("c"))
        .unwrap();

    // The periodic timer must tick at least four times before "a".
    assert!(wait_for(Duration::from_secs(5), || {
        events.lock().unwrap().contains(&"b")
    }));

    // Cancel the periodic timer from this (non-loop) thread.
    looper.cancel(periodic);
    barrier(&looper);
    let ticks_at_cancel = events.lock().unwrap().iter().filter(|e| **e == "c").count();

    let snapshot = events.lock().unwrap().clone();
    let a_at = snapshot.iter().position(|e| *e == "a").unwrap();
    let b_at = snapshot.iter().position(|e| *e == "b").unwrap();
    let c_before_a = snapshot[..a_at].iter().filter(|e| **e == "c").count();
    assert!(a_at < b_at);
    assert!(c_before_a >= 4, "only {} ticks before a", c_before_a);

    // No tick after the cancellation was processed.
    thread::sleep(Duration::from_millis(350));
    let ticks_now = events.lock().unwrap().iter().filter(|e| **e == "c").count();
    assert_eq!(ticks_at_cancel, ticks_now);

    stop_looper(looper, handle);
}

#[test]
fn periodic_spacing_is_at_least_the_interval() {
    let (looper, handle) = start_looper();

    let stamps = Arc::new(Mutex::new(Vec::new()));
    let st = Arc::clone(&stamps);
    let id = looper
        .run_every(50, 100, move || st.lock().unwrap().push(Instant::now()))
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        stamps.lock().unwrap().len() >= 4
    }));
    looper.cancel(id);
    barrier(&looper);

    // Firing times follow an absolute schedule, so a late tick may sit
    // close to its successor; the span over several ticks is the stable
    // measure.
    let stamps = stamps.lock().unwrap();
    let span = *stamps.last().unwrap() - stamps[0];
    let gaps = stamps.len() as u64 - 1;
    assert!(
        span >= Duration::from_millis(gaps * 100 - 50),
        "{} ticks within {:?}",
        stamps.len(),
        span
    );

    stop_looper(looper, handle);
}

#[test]
fn cancel_is_idempotent() {
    let (looper, handle) = start_looper();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = Arc::clone(&fired);
    let id = looper
        .run_after(5_000, move || {
            f.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

    looper.cancel(id);
    looper.cancel(id);
    looper.cancel(evio::TimerId::default());
    barrier(&looper);

    assert_eq!(fired.load(Ordering::Relaxed), 0);

    stop_looper(looper, handle);
}

#[test]
fn timer_can_cancel_itself() {
    let (looper, handle) = start_looper();

    let fired = Arc::new(AtomicUsize::new(0));

    // The timer cancels itself on the third tick; the re-insert-first
    // order makes the id live while the callback runs.
    let (tx, rx) = mpsc::channel::<evio::TimerId>();
    let rx = Mutex::new(rx);
    let inner_looper = Arc::clone(&looper);
    let f = Arc::clone(&fired);
    let id = looper
        .run_every(20, 20, move || {
            let n = f.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 3 {
                let id = rx.lock().unwrap().recv().unwrap();
                inner_looper.cancel(id);
            }
        })
        .unwrap();
    tx.send(id).unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        fired.load(Ordering::Relaxed) == 3
    }));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::Relaxed), 3);

    stop_looper(looper, handle);
}

#[test]
fn wakeup_interrupts_an_idle_wait() {
    init();

    let looper = Looper::new().unwrap();
    let thread_looper = Arc::clone(&looper);
    let handle = thread::spawn(move || thread_looper.run());

    // No timers scheduled: the loop is parked in the poller. Repeated
    // wakeups must not wedge it, and a quit must get through promptly.
    thread::sleep(Duration::from_millis(50));
    for _ in 0..3 {
        looper.wakeup();
    }
    looper.quit();
    handle.join().unwrap().unwrap();
}

#[test]
fn tasks_dispatched_during_shutdown_still_run() {
    let (looper, handle) = start_looper();

    let ran = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&ran);
    let inner = Arc::clone(&looper);
    looper.dispatch(move || {
        inner.quit();
        let r2 = Arc::clone(&r);
        inner.dispatch(move || {
            r2.fetch_add(1, Ordering::Relaxed);
        });
    });

    handle.join().unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 1);
}
