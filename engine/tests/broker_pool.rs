//! Broker population tests: the pending and throttle caps hold at every
//! instant, the budget is spent exactly, and the done signal fires only
//! when everything has drained.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use engine::context::{Callbacks, Resources};
use engine::settings::Settings;
use engine::{SocketBroker, SocketCallback, TrafficSocket};

fn counting_callback(count: Arc<AtomicUsize>) -> SocketCallback {
    Arc::new(move |weak: Weak<TrafficSocket>| {
        if let Some(socket) = weak.upgrade() {
            count.fetch_add(1, Ordering::SeqCst);
            socket.complete_state(None);
        }
    })
}

#[test]
fn broker_honors_caps_and_spends_the_budget() {
    // 10 iterations of 10 connections, at most 3 concurrent setups
    let settings = Arc::new(Settings {
        connection_limit: 10,
        connection_throttle: 3,
        iterations: Some(10),
        tick_ms: 5,
        ..Default::default()
    });
    let resources = Resources::new(Arc::clone(&settings)).expect("resources");

    let creates = Arc::new(AtomicUsize::new(0));
    let connects = Arc::new(AtomicUsize::new(0));
    let ios = Arc::new(AtomicUsize::new(0));
    let closings = Arc::new(AtomicUsize::new(0));
    let closings_probe = Arc::clone(&closings);

    let callbacks = Arc::new(Callbacks {
        create_fn: counting_callback(Arc::clone(&creates)),
        connect_fn: counting_callback(Arc::clone(&connects)),
        io_fn: counting_callback(Arc::clone(&ios)),
        closing_fn: Some(Arc::new(move |_weak| {
            closings_probe.fetch_add(1, Ordering::SeqCst);
        })),
    });

    let broker = SocketBroker::new(resources, callbacks, None);

    // sample the broker counters while it runs: pending never exceeds the
    // throttle, and pending + active never exceeds the connection limit
    let stop_sampling = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let broker = Arc::clone(&broker);
        let stop = Arc::clone(&stop_sampling);
        let violations = Arc::clone(&violations);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let (_remaining, pending, active) = broker.counters();
                if pending > 3 || pending + active > 10 {
                    violations.fetch_add(1, Ordering::Relaxed);
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    broker.start();
    assert!(
        broker.wait(Some(Duration::from_secs(30))),
        "broker never signalled done"
    );
    stop_sampling.store(true, Ordering::Relaxed);
    sampler.join().unwrap();

    assert_eq!(violations.load(Ordering::Relaxed), 0, "cap violated");
    assert_eq!(creates.load(Ordering::SeqCst), 100);
    assert_eq!(connects.load(Ordering::SeqCst), 100);
    assert_eq!(ios.load(Ordering::SeqCst), 100);
    assert_eq!(closings.load(Ordering::SeqCst), 100);

    let (remaining, pending, active) = broker.counters();
    assert_eq!((remaining, pending, active), (0, 0, 0));
}

#[test]
fn failed_connections_still_drain_the_budget() {
    let settings = Arc::new(Settings {
        connection_limit: 4,
        iterations: Some(2),
        tick_ms: 5,
        ..Default::default()
    });
    let resources = Resources::new(Arc::clone(&settings)).expect("resources");

    let creates = Arc::new(AtomicUsize::new(0));
    let ios = Arc::new(AtomicUsize::new(0));
    let creates_cb = Arc::clone(&creates);

    // every other connection fails at create; the rest run through io
    let callbacks = Arc::new(Callbacks {
        create_fn: Arc::new(move |weak: Weak<TrafficSocket>| {
            if let Some(socket) = weak.upgrade() {
                let n = creates_cb.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    socket.complete_state(Some(engine::TransferError::Io(
                        std::io::ErrorKind::Other,
                    )));
                } else {
                    socket.complete_state(None);
                }
            }
        }),
        connect_fn: counting_callback(Arc::new(AtomicUsize::new(0))),
        io_fn: counting_callback(Arc::clone(&ios)),
        closing_fn: None,
    });

    let broker = SocketBroker::new(resources, callbacks, None);
    broker.start();
    assert!(
        broker.wait(Some(Duration::from_secs(30))),
        "broker never signalled done"
    );

    assert_eq!(creates.load(Ordering::SeqCst), 8);
    assert_eq!(ios.load(Ordering::SeqCst), 4);
}

#[test]
fn shutdown_stops_spawning_and_wait_returns() {
    let settings = Arc::new(Settings {
        connection_limit: 2,
        iterations: None, // unbounded
        tick_ms: 5,
        ..Default::default()
    });
    let resources = Resources::new(Arc::clone(&settings)).expect("resources");

    let callbacks = Arc::new(Callbacks {
        create_fn: counting_callback(Arc::new(AtomicUsize::new(0))),
        connect_fn: counting_callback(Arc::new(AtomicUsize::new(0))),
        io_fn: counting_callback(Arc::new(AtomicUsize::new(0))),
        closing_fn: None,
    });

    let broker = SocketBroker::new(resources, callbacks, None);
    broker.start();

    // an unbounded run only ends on interrupt
    assert!(!broker.wait(Some(Duration::from_millis(200))));
    broker.shutdown();
    assert!(broker.wait(Some(Duration::from_secs(5))));
    assert!(broker.is_interrupted());
}
