//! The serial I/O strategy.
//!
//! One outstanding operation at a time: each call issues at most a single
//! task, and the next task is pulled only from that task's completion.

use std::sync::Weak;
use std::time::Duration;

use crate::io::{IoOutcome, process_scheduled_task, process_task};
use crate::socket::TrafficSocket;
use crate::task::TaskAction;

/// The io callback for serial operation.
pub fn start_io(weak: Weak<TrafficSocket>) {
    let Some(socket) = weak.upgrade() else { return };
    let pattern = socket.pattern();

    socket.increment_io();

    let mut outcome = IoOutcome::default();
    let task = pattern.initiate_io();
    if task.action != TaskAction::None {
        socket.increment_io();

        if task.time_offset_ms > 0 {
            let delay = Duration::from_millis(task.time_offset_ms);
            let weak_task = weak.clone();
            socket
                .timer()
                .schedule(delay, move || process_scheduled_task(weak_task, task, start_io));
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
            debug_assert!(remaining > 0, "serial io released the last count");
        }
    }

    if socket.decrement_io() == 0 {
        socket.complete_state(outcome.error);
    }
}
