//! The client create and connect path.
//!
//! The create callback prepares a socket with the configured options and
//! local binding; the connect callback starts the non-blocking connect
//! through the reactor and completes the state machine when it resolves.
//! Target addresses are used round-robin across connections.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::context::{Resources, SocketCallback};
use crate::error::TransferError;
use crate::settings::{Protocol, Settings};
use crate::socket::TrafficSocket;

/// Build the create callback for the client role.
pub fn client_create_fn(resources: Arc<Resources>) -> SocketCallback {
    Arc::new(move |weak: Weak<TrafficSocket>| {
        let Some(socket) = weak.upgrade() else { return };
        match create_socket(&resources.settings) {
            Ok(prepared) => {
                socket.stage_socket(prepared);
                socket.complete_state(None);
            }
            Err(e) => {
                tracing::debug!("socket creation failed: {e}");
                socket.complete_state(Some(TransferError::from_io(&e)));
            }
        }
    })
}

/// Build the connect callback for the client role.
pub fn client_connect_fn(resources: Arc<Resources>) -> SocketCallback {
    let next_target = Arc::new(AtomicUsize::new(0));
    Arc::new(move |weak: Weak<TrafficSocket>| {
        let Some(socket) = weak.upgrade() else { return };
        let Some(prepared) = socket.take_staged_socket() else {
            socket.complete_state(Some(TransferError::Io(io::ErrorKind::NotConnected)));
            return;
        };
        let targets = &resources.settings.targets;
        if targets.is_empty() {
            socket.complete_state(Some(TransferError::Io(io::ErrorKind::AddrNotAvailable)));
            return;
        }
        let target = targets[next_target.fetch_add(1, Ordering::Relaxed) % targets.len()];

        match resources.settings.protocol {
            Protocol::Tcp => connect_tcp(&socket, prepared, target, weak.clone()),
            Protocol::Udp => connect_udp(&socket, prepared, target),
        }
    })
}

fn connect_tcp(
    socket: &Arc<TrafficSocket>,
    prepared: socket2::Socket,
    target: SocketAddr,
    weak: Weak<TrafficSocket>,
) {
    let result = socket.reactor().connect_tcp(
        prepared,
        target,
        Box::new(move |handle, outcome| {
            let Some(socket) = weak.upgrade() else { return };
            match outcome {
                Ok(()) => {
                    socket.set_conn_handle(handle);
                    socket.complete_state(None);
                }
                Err(e) => {
                    tracing::debug!(%target, "connect failed: {e}");
                    socket.reactor().close(handle, false);
                    socket.complete_state(Some(TransferError::from_io(&e)));
                }
            }
        }),
    );
    if let Err(e) = result {
        tracing::debug!(%target, "connect submit failed: {e}");
        socket.complete_state(Some(TransferError::from_io(&e)));
    }
}

fn connect_udp(socket: &Arc<TrafficSocket>, prepared: socket2::Socket, target: SocketAddr) {
    let outcome = (|| -> io::Result<()> {
        prepared.connect(&target.into())?;
        let std_socket: std::net::UdpSocket = prepared.into();
        let handle = socket.reactor().register_udp(std_socket, true)?;
        socket.set_conn_handle(handle);
        Ok(())
    })();
    match outcome {
        Ok(()) => socket.complete_state(None),
        Err(e) => {
            tracing::debug!(%target, "udp connect failed: {e}");
            socket.complete_state(Some(TransferError::from_io(&e)));
        }
    }
}

/// Create and configure a socket for an outgoing connection.
fn create_socket(settings: &Settings) -> io::Result<socket2::Socket> {
    let family = settings
        .targets
        .first()
        .map(|addr| match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        })
        .unwrap_or(socket2::Domain::IPV4);

    let socket = match settings.protocol {
        Protocol::Tcp => socket2::Socket::new(
            family,
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?,
        Protocol::Udp => socket2::Socket::new(
            family,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?,
    };
    socket.set_nonblocking(true)?;

    let options = &settings.options;
    if settings.protocol == Protocol::Tcp {
        socket.set_nodelay(true)?;
        if options.keepalive {
            socket.set_keepalive(true)?;
        }
    }
    if let Some(bytes) = options.recv_buf {
        socket.set_recv_buffer_size(bytes as usize)?;
    }
    if let Some(bytes) = options.send_buf {
        socket.set_send_buffer_size(bytes as usize)?;
    }
    if options.reuse_unicast_port {
        set_reuse_port(socket.as_raw_fd())?;
    }
    if settings.outgoing_if_index > 0 {
        if family == socket2::Domain::IPV4 {
            set_unicast_interface(socket.as_raw_fd(), settings.outgoing_if_index)?;
        } else {
            tracing::warn!("outgoing interface pinning is only applied to IPv4 sockets");
        }
    }

    bind_local(settings, &socket, family)?;
    Ok(socket)
}

/// Pin outgoing unicast traffic to an interface. The index is passed in
/// network byte order, as the option requires.
fn set_unicast_interface(fd: i32, if_index: u32) -> io::Result<()> {
    let optval = if_index.to_be() as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_UNICAST_IF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}

/// Apply the configured local binding: an explicit bind address, an
/// ephemeral bind in the configured port range, or nothing.
fn bind_local(
    settings: &Settings,
    socket: &socket2::Socket,
    family: socket2::Domain,
) -> io::Result<()> {
    let want_v6 = family == socket2::Domain::IPV6;
    let bind_ip = settings
        .binds
        .iter()
        .find(|addr| addr.is_ipv6() == want_v6)
        .map(|addr| addr.ip());

    match (bind_ip, settings.local_port_range) {
        (None, None) => Ok(()),
        (ip, port_range) => {
            let ip = ip.unwrap_or(if want_v6 {
                std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
            } else {
                std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
            });
            match port_range {
                None => socket.bind(&SocketAddr::new(ip, 0).into()),
                Some((low, high)) => {
                    // walk the range until a port binds
                    let mut last_error =
                        io::Error::new(io::ErrorKind::AddrInUse, "local port range exhausted");
                    for port in low..=high {
                        match socket.bind(&SocketAddr::new(ip, port).into()) {
                            Ok(()) => return Ok(()),
                            Err(e) => last_error = e,
                        }
                    }
                    Err(last_error)
                }
            }
        }
    }
}

fn set_reuse_port(fd: i32) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
}
