//! End-to-end loopback exchange: a server broker and a client broker in one
//! process, running the push pattern over real sockets through the full
//! connection-id / payload / completion-marker / teardown sequence.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use engine::context::{Callbacks, Resources};
use engine::io::pipelined;
use engine::settings::{BufferPlan, PatternVariant, Role, Settings, TcpShutdownMode};
use engine::{AcceptPool, SocketBroker, SocketCallback, TrafficSocket};

const TRANSFER: u64 = 64 * 1024;
const CONNECTIONS: u64 = 2;

fn io_callback() -> SocketCallback {
    Arc::new(pipelined::start_io)
}

/// create_fn for the server role: the socket arrives via accept, so the
/// create phase has nothing to do.
fn server_create_fn() -> SocketCallback {
    Arc::new(|weak: Weak<TrafficSocket>| {
        if let Some(socket) = weak.upgrade() {
            socket.complete_state(None);
        }
    })
}

/// closing_fn that sums confirmed bytes and counts closings.
fn probe_closing_fn(bytes: Arc<AtomicU64>, closings: Arc<AtomicUsize>) -> SocketCallback {
    Arc::new(move |weak: Weak<TrafficSocket>| {
        if let Some(socket) = weak.upgrade() {
            bytes.fetch_add(socket.pattern().confirmed_bytes(), Ordering::SeqCst);
            closings.fetch_add(1, Ordering::SeqCst);
        }
    })
}

fn transfer_round_trip(shutdown: TcpShutdownMode) {
    // server side
    let server_settings = Arc::new(Settings {
        role: Role::Server,
        pattern: PatternVariant::Push,
        transfer_size: TRANSFER,
        buffer: BufferPlan::Fixed(4096),
        accept_limit: 8,
        server_exit_limit: CONNECTIONS,
        tick_ms: 5,
        listens: vec!["127.0.0.1:0".parse().unwrap()],
        ..Default::default()
    });
    let server_resources = Resources::new(Arc::clone(&server_settings)).expect("server resources");
    let accept_pool = AcceptPool::start(Arc::clone(&server_resources.reactor), &server_settings)
        .expect("listen");
    let bound = accept_pool.local_addrs()[0];

    let server_bytes = Arc::new(AtomicU64::new(0));
    let server_closings = Arc::new(AtomicUsize::new(0));
    let accept_for_cb = Arc::clone(&accept_pool);
    let server_callbacks = Arc::new(Callbacks {
        create_fn: server_create_fn(),
        connect_fn: Arc::new(move |weak| accept_for_cb.accept(weak)),
        io_fn: io_callback(),
        closing_fn: Some(probe_closing_fn(
            Arc::clone(&server_bytes),
            Arc::clone(&server_closings),
        )),
    });
    let server_broker =
        SocketBroker::new(server_resources, server_callbacks, Some(accept_pool));
    server_broker.start();

    // client side
    let client_settings = Arc::new(Settings {
        role: Role::Client,
        pattern: PatternVariant::Push,
        shutdown,
        transfer_size: TRANSFER,
        buffer: BufferPlan::Fixed(4096),
        connection_limit: CONNECTIONS as u32,
        iterations: Some(1),
        tick_ms: 5,
        targets: vec![bound],
        ..Default::default()
    });
    let client_resources = Resources::new(Arc::clone(&client_settings)).expect("client resources");

    let client_bytes = Arc::new(AtomicU64::new(0));
    let client_closings = Arc::new(AtomicUsize::new(0));
    let client_callbacks = Arc::new(Callbacks {
        create_fn: engine::connect::client_create_fn(Arc::clone(&client_resources)),
        connect_fn: engine::connect::client_connect_fn(Arc::clone(&client_resources)),
        io_fn: io_callback(),
        closing_fn: Some(probe_closing_fn(
            Arc::clone(&client_bytes),
            Arc::clone(&client_closings),
        )),
    });
    let client_broker = SocketBroker::new(client_resources, client_callbacks, None);
    client_broker.start();

    assert!(
        client_broker.wait(Some(Duration::from_secs(30))),
        "client broker never drained"
    );
    assert!(
        server_broker.wait(Some(Duration::from_secs(30))),
        "server broker never drained"
    );

    assert_eq!(client_closings.load(Ordering::SeqCst), CONNECTIONS as usize);
    assert_eq!(server_closings.load(Ordering::SeqCst), CONNECTIONS as usize);
    // every connection moved the full transfer in each direction's view
    assert_eq!(client_bytes.load(Ordering::SeqCst), TRANSFER * CONNECTIONS);
    assert_eq!(server_bytes.load(Ordering::SeqCst), TRANSFER * CONNECTIONS);
}

#[test]
fn push_transfer_with_graceful_shutdown() {
    transfer_round_trip(TcpShutdownMode::Graceful);
}

#[test]
fn push_transfer_with_hard_shutdown() {
    // the client resets after the completion marker; the server treats the
    // reset in its FIN-wait as a benign teardown
    transfer_round_trip(TcpShutdownMode::Hard);
}

#[test]
fn pull_transfer_moves_bytes_to_the_client() {
    let server_settings = Arc::new(Settings {
        role: Role::Server,
        pattern: PatternVariant::Pull,
        transfer_size: TRANSFER,
        buffer: BufferPlan::Fixed(8192),
        accept_limit: 4,
        server_exit_limit: 1,
        tick_ms: 5,
        listens: vec!["127.0.0.1:0".parse().unwrap()],
        ..Default::default()
    });
    let server_resources = Resources::new(Arc::clone(&server_settings)).expect("server resources");
    let accept_pool = AcceptPool::start(Arc::clone(&server_resources.reactor), &server_settings)
        .expect("listen");
    let bound = accept_pool.local_addrs()[0];

    let server_bytes = Arc::new(AtomicU64::new(0));
    let server_closings = Arc::new(AtomicUsize::new(0));
    let accept_for_cb = Arc::clone(&accept_pool);
    let server_callbacks = Arc::new(Callbacks {
        create_fn: server_create_fn(),
        connect_fn: Arc::new(move |weak| accept_for_cb.accept(weak)),
        io_fn: io_callback(),
        closing_fn: Some(probe_closing_fn(
            Arc::clone(&server_bytes),
            Arc::clone(&server_closings),
        )),
    });
    let server_broker =
        SocketBroker::new(server_resources, server_callbacks, Some(accept_pool));
    server_broker.start();

    let client_settings = Arc::new(Settings {
        role: Role::Client,
        pattern: PatternVariant::Pull,
        transfer_size: TRANSFER,
        buffer: BufferPlan::Fixed(8192),
        connection_limit: 1,
        iterations: Some(1),
        tick_ms: 5,
        targets: vec![bound],
        ..Default::default()
    });
    let client_resources = Resources::new(Arc::clone(&client_settings)).expect("client resources");

    let client_bytes = Arc::new(AtomicU64::new(0));
    let client_closings = Arc::new(AtomicUsize::new(0));
    let client_callbacks = Arc::new(Callbacks {
        create_fn: engine::connect::client_create_fn(Arc::clone(&client_resources)),
        connect_fn: engine::connect::client_connect_fn(Arc::clone(&client_resources)),
        io_fn: io_callback(),
        closing_fn: Some(probe_closing_fn(
            Arc::clone(&client_bytes),
            Arc::clone(&client_closings),
        )),
    });
    let client_broker = SocketBroker::new(client_resources, client_callbacks, None);
    client_broker.start();

    assert!(client_broker.wait(Some(Duration::from_secs(30))));
    assert!(server_broker.wait(Some(Duration::from_secs(30))));
    assert_eq!(client_bytes.load(Ordering::SeqCst), TRANSFER);
    assert_eq!(server_bytes.load(Ordering::SeqCst), TRANSFER);
}
