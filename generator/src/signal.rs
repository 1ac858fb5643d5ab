//! Signal handling.
//!
//! The first interrupt asks the broker for a graceful drain: no new
//! connections, in-flight transfers finish naturally. A second interrupt
//! forces the process down.

use std::sync::Arc;

use engine::SocketBroker;

pub fn install(broker: Arc<SocketBroker>) {
    ctrlc::set_handler(move || {
        if broker.is_interrupted() {
            tracing::warn!("second interrupt, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("interrupt received, draining connections");
        broker.shutdown();
    })
    .expect("failed to install signal handler");
}
