//! Role wiring: compose the engine's callbacks for the configured role and
//! protocol, run the broker to completion, and drive the status output.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use engine::context::{Callbacks, Resources};
use engine::io::{pipelined, serial};
use engine::settings::{IoMode, Protocol, Role, Settings};
use engine::{AcceptPool, SocketBroker, SocketCallback, TrafficSocket, TransferError};
use parking_lot::Mutex;

use crate::config::Config;
use crate::output::{StatusColumns, StatusWriter};
use crate::signal;

/// A create or connect phase with nothing to do on this role.
fn noop_phase_fn() -> SocketCallback {
    Arc::new(|weak: Weak<TrafficSocket>| {
        if let Some(socket) = weak.upgrade() {
            socket.complete_state(None);
        }
    })
}

/// UDP server create: bind a reuseport socket on a listen address and
/// register it unconnected - it locks on to the first peer that sends.
fn udp_server_create_fn(resources: Arc<Resources>) -> SocketCallback {
    let next_listen = Arc::new(AtomicUsize::new(0));
    Arc::new(move |weak: Weak<TrafficSocket>| {
        let Some(socket) = weak.upgrade() else { return };
        let listens = &resources.settings.listens;
        let addr = listens[next_listen.fetch_add(1, Ordering::Relaxed) % listens.len()];
        match bind_udp_listener(addr) {
            Ok(bound) => match socket.reactor().register_udp(bound, false) {
                Ok(handle) => {
                    socket.set_conn_handle(handle);
                    socket.refresh_addrs();
                    socket.complete_state(None);
                }
                Err(e) => socket.complete_state(Some(TransferError::from_io(&e))),
            },
            Err(e) => {
                tracing::warn!(%addr, "udp bind failed: {e}");
                socket.complete_state(Some(TransferError::from_io(&e)));
            }
        }
    })
}

fn bind_udp_listener(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn io_fn(settings: &Settings) -> SocketCallback {
    match settings.io_mode {
        IoMode::Pipelined => Arc::new(pipelined::start_io),
        IoMode::Serial => Arc::new(serial::start_io),
    }
}

/// Run the configured role to completion. Returns once the broker drains,
/// the time limit fires, or the user interrupts.
pub fn run(config: &Config) -> io::Result<()> {
    let settings = Arc::new(config.settings.clone());
    let resources = Resources::new(Arc::clone(&settings))?;

    let (callbacks, accept_pool) = match (settings.role, settings.protocol) {
        (Role::Server, Protocol::Tcp) => {
            let accept_pool =
                AcceptPool::start(Arc::clone(&resources.reactor), &settings)?;
            let accept_for_cb = Arc::clone(&accept_pool);
            let callbacks = Callbacks {
                create_fn: noop_phase_fn(),
                connect_fn: Arc::new(move |weak| accept_for_cb.accept(weak)),
                io_fn: io_fn(&settings),
                closing_fn: None,
            };
            (callbacks, Some(accept_pool))
        }
        (Role::Server, Protocol::Udp) => {
            let callbacks = Callbacks {
                create_fn: udp_server_create_fn(Arc::clone(&resources)),
                connect_fn: noop_phase_fn(),
                io_fn: io_fn(&settings),
                closing_fn: None,
            };
            (callbacks, None)
        }
        (Role::Client, _) => {
            let callbacks = Callbacks {
                create_fn: engine::connect::client_create_fn(Arc::clone(&resources)),
                connect_fn: engine::connect::client_connect_fn(Arc::clone(&resources)),
                io_fn: io_fn(&settings),
                closing_fn: None,
            };
            (callbacks, None)
        }
    };

    let broker = SocketBroker::new(
        Arc::clone(&resources),
        Arc::new(callbacks),
        accept_pool,
    );
    signal::install(Arc::clone(&broker));

    // periodic status rows driven from the shared timer
    let writer = Arc::new(Mutex::new(StatusWriter::new(
        StatusColumns::for_protocol(settings.protocol),
        config.format,
    )));
    {
        let writer = writer.lock();
        writer.print_legend();
        writer.print_header();
    }
    {
        let writer = Arc::clone(&writer);
        let weak_broker = Arc::downgrade(&broker);
        resources
            .timer
            .schedule_recurring(config.status_interval, move || {
                writer.lock().print_interval();
                weak_broker.strong_count() > 0
            });
    }

    broker.start();

    if !broker.wait(config.time_limit) {
        tracing::info!(
            "time limit of {} ms reached",
            config.time_limit.map(|t| t.as_millis()).unwrap_or(0)
        );
        broker.shutdown();
    }

    // on interrupt or time limit, in-flight connections finish naturally
    let drain_deadline = std::time::Instant::now() + Duration::from_secs(30);
    while !broker.is_done() && std::time::Instant::now() < drain_deadline {
        std::thread::sleep(Duration::from_millis(50));
    }

    // one final row so short runs still report
    writer.lock().print_interval();
    resources.reactor.shutdown();
    Ok(())
}
