//! The per-connection descriptor.
//!
//! A `TrafficSocket` owns the live transport registration, the pattern that
//! governs its bytes, and the in-flight operation count that decides when the
//! connection has quiesced. The broker's pool entry is the only strong owner;
//! completion closures hold weak references so a late completion on a
//! discarded connection is a no-op rather than a dangling access.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::TransferError;
use crate::pattern::IoPattern;
use crate::reactor::{ConnHandle, Reactor};
use crate::state::SocketState;
use crate::timer::Timer;

pub struct TrafficSocket {
    id: u64,
    reactor: Arc<Reactor>,
    timer: Arc<Timer>,
    pattern: Arc<IoPattern>,
    /// The transport registration; populated between create/accept and close.
    conn: Mutex<Option<ConnHandle>>,
    /// A created-but-not-yet-connected socket staged by the create callback.
    staged: Mutex<Option<socket2::Socket>>,
    local_addr: Mutex<Option<SocketAddr>>,
    remote_addr: Mutex<Option<SocketAddr>>,
    /// Operations in flight; the connection is quiescent at zero.
    io_count: AtomicI64,
    state: Mutex<Weak<SocketState>>,
}

impl TrafficSocket {
    pub fn new(
        id: u64,
        reactor: Arc<Reactor>,
        timer: Arc<Timer>,
        pattern: Arc<IoPattern>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            reactor,
            timer,
            pattern,
            conn: Mutex::new(None),
            staged: Mutex::new(None),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            io_count: AtomicI64::new(0),
            state: Mutex::new(Weak::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub fn pattern(&self) -> Arc<IoPattern> {
        Arc::clone(&self.pattern)
    }

    pub(crate) fn bind_state(&self, state: Weak<SocketState>) {
        *self.state.lock() = state;
    }

    /// Forward a phase completion to the owning state machine. The callback
    /// surface promises exactly one call per invoked phase.
    pub fn complete_state(&self, error: Option<TransferError>) {
        let state = self.state.lock().upgrade();
        if let Some(state) = state {
            state.complete_state(error);
        }
    }

    pub fn increment_io(&self) -> i64 {
        self.io_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decrement_io(&self) -> i64 {
        let prior = self.io_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prior > 0, "io count underflow on connection {}", self.id);
        prior - 1
    }

    pub fn io_count(&self) -> i64 {
        self.io_count.load(Ordering::Acquire)
    }

    /// Hold a prepared-but-unconnected socket between the create and
    /// connect phases.
    pub fn stage_socket(&self, socket: socket2::Socket) {
        *self.staged.lock() = Some(socket);
    }

    pub fn take_staged_socket(&self) -> Option<socket2::Socket> {
        self.staged.lock().take()
    }

    pub fn set_conn_handle(&self, handle: ConnHandle) {
        *self.conn.lock() = Some(handle);
    }

    pub fn conn_handle(&self) -> Option<ConnHandle> {
        *self.conn.lock()
    }

    pub fn set_addrs(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>) {
        *self.local_addr.lock() = local;
        *self.remote_addr.lock() = remote;
    }

    /// Read the addresses back from the live registration.
    pub fn refresh_addrs(&self) {
        if let Some(conn) = self.conn_handle() {
            self.set_addrs(self.reactor.local_addr(conn), self.reactor.peer_addr(conn));
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    /// Release the transport registration. Hard closes reset the peer.
    pub fn close_socket(&self, hard: bool) {
        let handle = self.conn.lock().take();
        if let Some(handle) = handle {
            self.reactor.close(handle, hard);
        }
        self.staged.lock().take();
    }

    /// Defer a job through the shared timer (rate-limit delays, state
    /// transitions).
    pub fn schedule(&self, delay_ms: u64, job: impl FnOnce() + Send + 'static) {
        self.timer.schedule(Duration::from_millis(delay_ms), job);
    }
}
