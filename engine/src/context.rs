//! Shared run context: the reactor, timer, id registry, and the callback
//! surface each connection is driven through.

use std::io;
use std::sync::{Arc, Weak};

use crate::idbuf::ConnectionIdPool;
use crate::reactor::Reactor;
use crate::settings::{Role, Settings};
use crate::socket::TrafficSocket;
use crate::timer::Timer;

/// A polymorphic phase callback. Receives a weak handle so a callback held
/// past the connection's life cannot extend it.
pub type SocketCallback = Arc<dyn Fn(Weak<TrafficSocket>) + Send + Sync>;

/// The three lifecycle callbacks (plus the optional closing hook) every
/// connection is driven through. Each is invoked exactly once per connection
/// attempt and must call `complete_state` exactly once.
pub struct Callbacks {
    pub create_fn: SocketCallback,
    /// Connect (client) or accept (server); the two are mutually exclusive
    /// and the role decides which is wired in.
    pub connect_fn: SocketCallback,
    pub io_fn: SocketCallback,
    pub closing_fn: Option<SocketCallback>,
}

/// Process-wide resources, constructed once at startup.
pub struct Resources {
    pub settings: Arc<Settings>,
    pub reactor: Arc<Reactor>,
    pub timer: Arc<Timer>,
    pub ids: Arc<ConnectionIdPool>,
    pub payload: Arc<[u8]>,
}

impl Resources {
    pub fn new(settings: Arc<Settings>) -> io::Result<Arc<Self>> {
        let completion_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        let reactor = Reactor::spawn(completion_threads)?;
        let timer = Timer::spawn();
        let ids = Arc::new(match settings.role {
            Role::Client => ConnectionIdPool::for_client(settings.connection_limit as usize),
            Role::Server => ConnectionIdPool::for_server(),
        });
        let payload = settings.build_payload();
        Ok(Arc::new(Self {
            settings,
            reactor,
            timer,
            ids,
            payload,
        }))
    }
}
