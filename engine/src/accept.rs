//! The server accept path.
//!
//! Listeners feed accepted connections into a ready queue bounded by the
//! accept budget; connection state machines asking for a socket either pop a
//! ready connection or park themselves in a pended queue. Whichever side
//! arrives second completes the exchange. Shutdown drains both queues,
//! failing every pended caller with a connection-aborted error.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use mio::net::TcpStream as MioTcpStream;
use parking_lot::Mutex;

use crate::error::TransferError;
use crate::reactor::{AcceptHandler, ListenerHandle, Reactor};
use crate::settings::Settings;
use crate::socket::TrafficSocket;

struct AcceptedConnection {
    stream: MioTcpStream,
    local_addr: Option<SocketAddr>,
    peer_addr: SocketAddr,
}

struct AcceptInner {
    ready: VecDeque<AcceptedConnection>,
    pended: VecDeque<Weak<TrafficSocket>>,
    shutdown: bool,
    paused: bool,
}

pub struct AcceptPool {
    reactor: Arc<Reactor>,
    inner: Mutex<AcceptInner>,
    listeners: Mutex<Vec<ListenerHandle>>,
    /// Bound on the ready queue; listeners pause once it is reached.
    accept_limit: usize,
}

impl AcceptPool {
    /// Bind every configured listen address and begin accepting.
    pub fn start(reactor: Arc<Reactor>, settings: &Settings) -> io::Result<Arc<Self>> {
        let pool = Arc::new(Self {
            reactor: Arc::clone(&reactor),
            inner: Mutex::new(AcceptInner {
                ready: VecDeque::new(),
                pended: VecDeque::new(),
                shutdown: false,
                paused: false,
            }),
            listeners: Mutex::new(Vec::new()),
            accept_limit: settings.accept_limit.max(1) as usize,
        });

        let backlog = settings.accept_limit.max(128);
        let mut handles = Vec::with_capacity(settings.listens.len());
        for &addr in &settings.listens {
            let weak = Arc::downgrade(&pool);
            let handler: AcceptHandler = Arc::new(move |stream, peer| {
                if let Some(pool) = weak.upgrade() {
                    pool.on_accept(stream, peer);
                }
            });
            let handle = reactor.listen(addr, backlog, handler)?;
            tracing::info!(%addr, "listening");
            handles.push(handle);
        }
        if handles.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no listen addresses configured",
            ));
        }
        *pool.listeners.lock() = handles;
        Ok(pool)
    }

    /// Bound addresses, with ephemeral ports resolved.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .iter()
            .filter_map(|&handle| self.reactor.listener_addr(handle))
            .collect()
    }

    /// A state machine wants an accepted socket: pop one from the ready
    /// queue or park the request.
    pub fn accept(&self, weak: Weak<TrafficSocket>) {
        let popped = {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                drop(inner);
                if let Some(socket) = weak.upgrade() {
                    socket.complete_state(Some(TransferError::Io(
                        io::ErrorKind::ConnectionAborted,
                    )));
                }
                return;
            }
            match inner.ready.pop_front() {
                Some(accepted) => {
                    self.maybe_resume(&mut inner);
                    Some(accepted)
                }
                None => {
                    inner.pended.push_back(weak.clone());
                    None
                }
            }
        };
        if let Some(accepted) = popped {
            self.fulfil(weak, accepted);
        }
    }

    /// Reactor handler: a fresh connection arrived on a listener.
    fn on_accept(&self, stream: MioTcpStream, peer_addr: SocketAddr) {
        let local_addr = stream.local_addr().ok();
        let accepted = AcceptedConnection { stream, local_addr, peer_addr };

        let waiter = {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return;
            }
            loop {
                match inner.pended.pop_front() {
                    // skip requests whose connection has already gone away
                    Some(weak) => {
                        if weak.upgrade().is_some() {
                            break Some(weak);
                        }
                    }
                    None => {
                        inner.ready.push_back(accepted);
                        if inner.ready.len() >= self.accept_limit {
                            self.maybe_pause(&mut inner);
                        }
                        return;
                    }
                }
            }
        };
        if let Some(weak) = waiter {
            self.fulfil(weak, accepted);
        }
    }

    /// Hand an accepted stream to a connection: register it with the
    /// reactor and complete the connect phase.
    fn fulfil(&self, weak: Weak<TrafficSocket>, accepted: AcceptedConnection) {
        let Some(socket) = weak.upgrade() else { return };
        match self.reactor.register_tcp(accepted.stream) {
            Ok(handle) => {
                socket.set_conn_handle(handle);
                socket.set_addrs(accepted.local_addr, Some(accepted.peer_addr));
                socket.complete_state(None);
            }
            Err(e) => {
                tracing::debug!("failed to register accepted connection: {e}");
                socket.complete_state(Some(TransferError::from_io(&e)));
            }
        }
    }

    fn maybe_pause(&self, inner: &mut AcceptInner) {
        if !inner.paused {
            inner.paused = true;
            for &handle in self.listeners.lock().iter() {
                self.reactor.pause_listener(handle);
            }
        }
    }

    fn maybe_resume(&self, inner: &mut AcceptInner) {
        if inner.paused && inner.ready.len() < self.accept_limit {
            inner.paused = false;
            for &handle in self.listeners.lock().iter() {
                self.reactor.resume_listener(handle);
            }
        }
    }

    /// Drain both queues; every pended caller completes exactly once with a
    /// connection-aborted error.
    pub fn shutdown(&self) {
        let pended = {
            let mut inner = self.inner.lock();
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
            inner.ready.clear();
            std::mem::take(&mut inner.pended)
        };
        for weak in pended {
            if let Some(socket) = weak.upgrade() {
                socket.complete_state(Some(TransferError::Io(
                    io::ErrorKind::ConnectionAborted,
                )));
            }
        }
    }
}
