//! The pipelined I/O strategy.
//!
//! Keeps pulling tasks while the pattern hands them out, so multiple sends
//! or recvs (bounded by the pre-post counts) stay outstanding against one
//! connection. Rate-limited sends are parked on the timer with their io
//! count held so the connection cannot be declared quiescent early.

use std::sync::Weak;
use std::time::Duration;

use crate::io::{IoOutcome, process_scheduled_task, process_task};
use crate::socket::TrafficSocket;
use crate::task::TaskAction;

/// The io callback for pipelined operation. Re-entered from completions
/// until the pattern stops handing out tasks.
pub fn start_io(weak: Weak<TrafficSocket>) {
    let Some(socket) = weak.upgrade() else { return };
    let pattern = socket.pattern();

    // hold a count across the loop so completions that land mid-iteration
    // cannot drive the connection to zero underneath us
    socket.increment_io();

    let mut outcome = IoOutcome::default();
    while !outcome.done {
        let task = pattern.initiate_io();
        if task.action == TaskAction::None {
            // nothing failed, just no more io right now
            break;
        }

        socket.increment_io();

        if task.time_offset_ms > 0 {
            let delay = Duration::from_millis(task.time_offset_ms);
            let weak_task = weak.clone();
            socket
                .timer()
                .schedule(delay, move || process_scheduled_task(weak_task, task, start_io));
            // the timer holds the count; stop pulling until it fires
            outcome = IoOutcome {
                error: None,
                started: true,
                done: true,
            };
        } else {
            outcome = process_task(&socket, &pattern, task, start_io);
        }

        if !outcome.started {
            let remaining = socket.decrement_io();
            debug_assert!(remaining > 0, "io loop released the last count");
        }
    }

    if socket.decrement_io() == 0 {
        socket.complete_state(outcome.error);
    }
}
