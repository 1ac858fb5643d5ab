//! Engine metrics.

use metriken::{Counter, Gauge, metric};

#[metric(name = "bytes_sent", description = "Total payload bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(name = "bytes_recv", description = "Total payload bytes received")]
pub static BYTES_RECV: Counter = Counter::new();

#[metric(
    name = "connections_completed",
    description = "Connections that finished their transfer successfully"
)]
pub static CONNECTIONS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "connection_errors",
    description = "Connections that failed with a transport error"
)]
pub static CONNECTION_ERRORS: Counter = Counter::new();

#[metric(
    name = "protocol_errors",
    description = "Connections that failed with a protocol violation"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(name = "connections_pending", description = "Connections in setup")]
pub static CONNECTIONS_PENDING: Gauge = Gauge::new();

#[metric(name = "connections_active", description = "Connections transferring")]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "frames_successful",
    description = "Media-stream frames received in order"
)]
pub static FRAMES_SUCCESSFUL: Counter = Counter::new();

#[metric(name = "frames_dropped", description = "Media-stream frames never received")]
pub static FRAMES_DROPPED: Counter = Counter::new();

#[metric(
    name = "frames_duplicate",
    description = "Media-stream frames received more than once"
)]
pub static FRAMES_DUPLICATE: Counter = Counter::new();

#[metric(
    name = "frames_error",
    description = "Media-stream datagrams that failed validation"
)]
pub static FRAMES_ERROR: Counter = Counter::new();
