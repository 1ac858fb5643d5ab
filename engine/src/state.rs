//! The per-connection lifecycle state machine.
//!
//! Drives a connection through create, connect-or-accept, and io using the
//! caller-supplied callbacks, then closes and reports to the broker.
//! Transitions are scheduled through the timer rather than run inline so a
//! synchronous `complete_state` never recurses back into the caller, and so
//! callbacks are never invoked while a lock is held.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::broker::SocketBroker;
use crate::context::{Callbacks, Resources};
use crate::error::TransferError;
use crate::idbuf::IdSlot;
use crate::metrics;
use crate::pattern::IoPattern;
use crate::socket::TrafficSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initialized,
    Creating,
    Created,
    Connecting,
    Connected,
    InitiatingIo,
    InitiatedIo,
    Closing,
    Closed,
}

struct StateInner {
    phase: LifecycleState,
    io_error: Option<TransferError>,
    id_slot: Option<IdSlot>,
}

pub struct SocketState {
    inner: Mutex<StateInner>,
    socket: Arc<TrafficSocket>,
    broker: Weak<SocketBroker>,
    resources: Arc<Resources>,
    callbacks: Arc<Callbacks>,
}

impl SocketState {
    pub fn new(
        id: u64,
        broker: Weak<SocketBroker>,
        resources: Arc<Resources>,
        callbacks: Arc<Callbacks>,
    ) -> Arc<Self> {
        let connection_id = protocol_traffic::format_connection_id(rand::random());
        let pattern = Arc::new(IoPattern::new(
            &resources.settings,
            connection_id,
            Arc::clone(&resources.payload),
        ));
        let socket = TrafficSocket::new(
            id,
            Arc::clone(&resources.reactor),
            Arc::clone(&resources.timer),
            pattern,
        );
        let state = Arc::new(Self {
            inner: Mutex::new(StateInner {
                phase: LifecycleState::Initialized,
                io_error: None,
                id_slot: None,
            }),
            socket: Arc::clone(&socket),
            broker,
            resources,
            callbacks,
        });
        socket.bind_state(Arc::downgrade(&state));
        state
    }

    pub fn socket(&self) -> &Arc<TrafficSocket> {
        &self.socket
    }

    pub fn current_state(&self) -> LifecycleState {
        self.inner.lock().phase
    }

    /// Begin the lifecycle: acquire a connection-id slot and invoke the
    /// create callback. Scheduled through the timer so the caller (usually
    /// the broker, under its own lock) never re-enters itself.
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.phase, LifecycleState::Initialized);
            inner.phase = LifecycleState::Creating;
        }
        let weak = Arc::downgrade(self);
        self.socket.schedule(0, move || {
            let Some(state) = weak.upgrade() else { return };

            let connection_id = state.socket.pattern().connection_id();
            match state.resources.ids.acquire(&connection_id) {
                Ok(slot) => {
                    state.inner.lock().id_slot = Some(slot);
                }
                Err(e) => {
                    tracing::warn!("failed to admit connection: {e}");
                    state.begin_closing(
                        false,
                        Some(TransferError::Io(std::io::ErrorKind::OutOfMemory)),
                    );
                    return;
                }
            }
            (state.callbacks.create_fn)(Arc::downgrade(&state.socket));
        });
    }

    /// A phase callback finished. Advances the machine; each invocation of
    /// create/connect/io lands here exactly once.
    pub fn complete_state(self: &Arc<Self>, error: Option<TransferError>) {
        let phase = self.inner.lock().phase;
        match phase {
            LifecycleState::Creating => {
                if error.is_none() {
                    self.inner.lock().phase = LifecycleState::Created;
                    self.schedule_connect();
                } else {
                    self.begin_closing(false, error);
                }
            }
            LifecycleState::Connecting => {
                if error.is_none() {
                    self.socket.refresh_addrs();
                    self.inner.lock().phase = LifecycleState::Connected;
                    if let (Some(local), Some(remote)) =
                        (self.socket.local_addr(), self.socket.remote_addr())
                    {
                        tracing::debug!(
                            connection = self.socket.id(),
                            %local,
                            %remote,
                            "connection established"
                        );
                    }
                    self.schedule_io();
                } else {
                    self.begin_closing(false, error);
                }
            }
            LifecycleState::InitiatingIo => {
                {
                    let mut inner = self.inner.lock();
                    inner.io_error = error;
                    inner.phase = LifecycleState::InitiatedIo;
                }
                self.begin_closing(true, error);
            }
            other => {
                tracing::error!(
                    connection = self.socket.id(),
                    ?other,
                    "complete_state invoked in an unexpected phase"
                );
            }
        }
    }

    fn schedule_connect(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.socket.schedule(0, move || {
            let Some(state) = weak.upgrade() else { return };
            state.inner.lock().phase = LifecycleState::Connecting;
            (state.callbacks.connect_fn)(Arc::downgrade(&state.socket));
        });
    }

    fn schedule_io(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.socket.schedule(0, move || {
            let Some(state) = weak.upgrade() else { return };
            state.inner.lock().phase = LifecycleState::InitiatingIo;
            // the broker moves this connection from pending to active
            // exactly once, before io begins
            if let Some(broker) = state.broker.upgrade() {
                broker.initiating_io();
            }
            (state.callbacks.io_fn)(Arc::downgrade(&state.socket));
        });
    }

    /// Tear down: release the socket and the id slot, record the outcome,
    /// and report to the broker.
    fn begin_closing(self: &Arc<Self>, was_active: bool, error: Option<TransferError>) {
        let slot = {
            let mut inner = self.inner.lock();
            if matches!(inner.phase, LifecycleState::Closing | LifecycleState::Closed) {
                return;
            }
            inner.phase = LifecycleState::Closing;
            inner.id_slot.take()
        };

        self.socket.close_socket(false);
        if let Some(slot) = slot {
            self.resources.ids.release(slot);
        }

        let pattern = self.socket.pattern();
        match error {
            None if was_active => {
                metrics::CONNECTIONS_COMPLETED.increment();
                tracing::info!(
                    connection = self.socket.id(),
                    bytes = pattern.confirmed_bytes(),
                    "transfer completed"
                );
            }
            None => {
                // closed from a pending phase without an error code; count
                // it as a transport-level failure
                metrics::CONNECTION_ERRORS.increment();
            }
            Some(e) if e.is_protocol() => {
                metrics::PROTOCOL_ERRORS.increment();
                tracing::warn!(
                    connection = self.socket.id(),
                    error = %e,
                    bytes = pattern.confirmed_bytes(),
                    "protocol violation"
                );
            }
            Some(e) => {
                metrics::CONNECTION_ERRORS.increment();
                tracing::debug!(
                    connection = self.socket.id(),
                    error = %e,
                    bytes = pattern.confirmed_bytes(),
                    "connection failed"
                );
            }
        }

        if let Some(closing_fn) = &self.callbacks.closing_fn {
            closing_fn(Arc::downgrade(&self.socket));
        }
        if let Some(broker) = self.broker.upgrade() {
            broker.closing(was_active);
        }

        self.inner.lock().phase = LifecycleState::Closed;
    }
}
