//! The socket broker.
//!
//! Owns the population of connection state machines. Two caps hold at all
//! times: `pending` (connections in setup) never exceeds the pending limit,
//! and outgoing setups never exceed the connection throttle. A recurring
//! tick retires closed entries and refills the pool; the done signal fires
//! exactly when the budget is spent and every connection has drained.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::accept::AcceptPool;
use crate::context::{Callbacks, Resources};
use crate::metrics;
use crate::state::{LifecycleState, SocketState};

struct BrokerInner {
    pool: Vec<Arc<SocketState>>,
    total_remaining: u64,
    pending: u32,
    active: u32,
    done: bool,
    interrupted: bool,
}

pub struct SocketBroker {
    inner: Mutex<BrokerInner>,
    signal: Condvar,
    resources: Arc<Resources>,
    callbacks: Arc<Callbacks>,
    accept: Option<Arc<AcceptPool>>,
    pending_limit: u32,
    next_socket_id: AtomicU64,
}

impl SocketBroker {
    pub fn new(
        resources: Arc<Resources>,
        callbacks: Arc<Callbacks>,
        accept: Option<Arc<AcceptPool>>,
    ) -> Arc<Self> {
        let settings = &resources.settings;
        Arc::new(Self {
            inner: Mutex::new(BrokerInner {
                pool: Vec::new(),
                total_remaining: settings.total_connections(),
                pending: 0,
                active: 0,
                done: false,
                interrupted: false,
            }),
            signal: Condvar::new(),
            pending_limit: settings.pending_limit(),
            resources: Arc::clone(&resources),
            callbacks,
            accept,
            next_socket_id: AtomicU64::new(1),
        })
    }

    /// Seed the pool and begin the maintenance tick.
    pub fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            tracing::info!(
                total = inner.total_remaining,
                pending_limit = self.pending_limit,
                "starting broker"
            );
            self.refill(&mut inner);
        }

        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.resources.settings.tick_ms.max(1));
        self.resources.timer.schedule_recurring(period, move || {
            match weak.upgrade() {
                Some(broker) => broker.tick(),
                None => false,
            }
        });
    }

    /// Spawn new state machines up to the caps. Caller holds the lock.
    fn refill(self: &Arc<Self>, inner: &mut BrokerInner) {
        let settings = &self.resources.settings;
        let is_server = settings.role.is_listening();
        while inner.total_remaining > 0 && inner.pending < self.pending_limit {
            if !is_server {
                // outgoing connections also honor the overall connection
                // limit and the concurrent-attempt throttle
                if inner.pending + inner.active >= settings.connection_limit {
                    break;
                }
                if inner.pending >= settings.connection_throttle {
                    break;
                }
            }
            let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
            let state = SocketState::new(
                id,
                Arc::downgrade(self),
                Arc::clone(&self.resources),
                Arc::clone(&self.callbacks),
            );
            state.start();
            inner.pool.push(state);
            inner.pending += 1;
            inner.total_remaining -= 1;
            metrics::CONNECTIONS_PENDING.increment();
        }
    }

    /// Periodic pool maintenance. Skips the round if a prior tick still
    /// holds the lock. Returns false once the broker is done, which cancels
    /// the recurring timer.
    fn tick(self: Arc<Self>) -> bool {
        let mut retired = Vec::new();
        {
            let Some(mut inner) = self.inner.try_lock() else {
                return true;
            };

            let mut kept = Vec::with_capacity(inner.pool.len());
            for state in inner.pool.drain(..) {
                if state.current_state() == LifecycleState::Closed {
                    retired.push(state);
                } else {
                    kept.push(state);
                }
            }
            inner.pool = kept;

            if inner.total_remaining == 0 && inner.pending == 0 && inner.active == 0 {
                if !inner.done {
                    tracing::info!("all connections drained");
                    inner.done = true;
                    self.signal.notify_all();
                }
                return false;
            }
            if !inner.interrupted {
                self.refill(&mut inner);
            } else if inner.pending == 0 && inner.active == 0 {
                // interrupted and drained: nothing more will run
                inner.done = true;
                self.signal.notify_all();
                return false;
            }
        }
        // retired state machines are destroyed outside the lock
        drop(retired);
        true
    }

    /// A connection moved from setup to transfer.
    pub fn initiating_io(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.pending > 0, "initiating_io with no pending connections");
        inner.pending -= 1;
        inner.active += 1;
        metrics::CONNECTIONS_PENDING.decrement();
        metrics::CONNECTIONS_ACTIVE.increment();
    }

    /// A connection closed; `was_active` selects which counter it held.
    pub fn closing(&self, was_active: bool) {
        let mut inner = self.inner.lock();
        if was_active {
            assert!(inner.active > 0, "closing(active) with no active connections");
            inner.active -= 1;
            metrics::CONNECTIONS_ACTIVE.decrement();
        } else {
            assert!(inner.pending > 0, "closing(pending) with no pending connections");
            inner.pending -= 1;
            metrics::CONNECTIONS_PENDING.decrement();
        }
    }

    /// Block until the pool drains or the user interrupts; false on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if inner.done || inner.interrupted {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.signal.wait_until(&mut inner, deadline).timed_out() {
                        return inner.done || inner.interrupted;
                    }
                }
                None => self.signal.wait(&mut inner),
            }
        }
    }

    /// Stop spawning, drain pended accepts, and let in-flight connections
    /// finish naturally.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.interrupted {
                return;
            }
            inner.interrupted = true;
        }
        tracing::info!("broker shutdown requested");
        if let Some(accept) = &self.accept {
            accept.shutdown();
        }
        self.signal.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.lock().interrupted
    }

    /// True once every connection has drained and nothing more will run.
    pub fn is_done(&self) -> bool {
        self.inner.lock().done
    }

    /// Snapshot of (total_remaining, pending, active) for status output.
    pub fn counters(&self) -> (u64, u32, u32) {
        let inner = self.inner.lock();
        (inner.total_remaining, inner.pending, inner.active)
    }
}
