//! The per-connection I/O engine.
//!
//! Pulls tasks from the pattern, submits them through the reactor, and
//! routes completions back into the pattern. The in-flight count is
//! incremented before every submit and decremented only after the completion
//! has been consumed; the state machine's io phase completes exactly when
//! the count returns to zero.
//!
//! Two strategies share this plumbing: [`pipelined`] keeps as many
//! operations outstanding as the pattern will hand out, [`serial`] runs one
//! at a time.

pub mod pipelined;
pub mod serial;

use std::io;
use std::sync::{Arc, Weak};

use crate::error::TransferError;
use crate::pattern::{IoPattern, Verdict};
use crate::socket::TrafficSocket;
use crate::task::{IoTask, TaskAction};

/// How a submit attempt resolved.
#[derive(Default)]
pub(crate) struct IoOutcome {
    pub error: Option<TransferError>,
    /// An async operation was submitted and holds an io count.
    pub started: bool,
    /// No further tasks should be pulled on this call path.
    pub done: bool,
}

/// Re-entry point invoked when a completion asks for more io.
pub(crate) type ContinueFn = fn(Weak<TrafficSocket>);

/// Issue one task. The caller must already hold an io count for it.
pub(crate) fn process_task(
    socket: &Arc<TrafficSocket>,
    pattern: &Arc<IoPattern>,
    task: IoTask,
    continue_fn: ContinueFn,
) -> IoOutcome {
    let Some(conn) = socket.conn_handle() else {
        // the socket is gone; the request must still complete
        let aborted = TransferError::Io(io::ErrorKind::ConnectionAborted);
        let verdict = pattern.complete_io(&task, 0, Some(aborted));
        return IoOutcome {
            error: Some(aborted),
            started: false,
            done: verdict != Verdict::Continue,
        };
    };

    match task.action {
        TaskAction::GracefulShutdown => {
            let error = socket
                .reactor()
                .shutdown_send(conn)
                .err()
                .map(|e| TransferError::from_io(&e));
            let verdict = pattern.complete_io(&task, 0, error);
            outcome_for(pattern, verdict)
        }
        TaskAction::HardShutdown => {
            socket.close_socket(true);
            let verdict = pattern.complete_io(&task, 0, None);
            outcome_for(pattern, verdict)
        }
        TaskAction::Send | TaskAction::Recv => {
            let wait_all = pattern.wants_wait_all(&task);
            let weak = Arc::downgrade(socket);
            socket.reactor().submit(
                conn,
                task,
                wait_all,
                Box::new(move |task, result| completion(weak, task, result, continue_fn)),
            );
            IoOutcome {
                error: None,
                started: true,
                done: false,
            }
        }
        TaskAction::None => IoOutcome::default(),
    }
}

fn outcome_for(pattern: &Arc<IoPattern>, verdict: Verdict) -> IoOutcome {
    match verdict {
        Verdict::Continue => IoOutcome {
            error: None,
            started: false,
            done: false,
        },
        Verdict::Completed => IoOutcome {
            error: None,
            started: false,
            done: true,
        },
        Verdict::Failed => IoOutcome {
            error: pattern.last_error(),
            started: false,
            done: true,
        },
    }
}

/// Completion callback shared by both strategies: fold the result into the
/// pattern, chase the verdict, and release the operation's io count.
fn completion(
    weak: Weak<TrafficSocket>,
    task: IoTask,
    result: io::Result<usize>,
    continue_fn: ContinueFn,
) {
    let Some(socket) = weak.upgrade() else { return };
    let pattern = socket.pattern();

    let (bytes, error) = match result {
        Ok(n) => (n as u64, None),
        Err(e) => {
            tracing::trace!(connection = socket.id(), "io failed: {e}");
            (0, Some(TransferError::from_io(&e)))
        }
    };

    let verdict = pattern.complete_io(&task, bytes, error);
    let final_error = match verdict {
        Verdict::Continue => {
            // ask for more while still holding this operation's count
            continue_fn(weak.clone());
            None
        }
        Verdict::Completed => None,
        Verdict::Failed => pattern.last_error(),
    };

    // decrement only after attempting new io: the prior operation is now
    // formally finished
    if socket.decrement_io() == 0 {
        socket.complete_state(final_error);
    }
}

/// Run a rate-limited task whose delay has elapsed. The timer has been
/// holding an io count since the task was scheduled.
pub(crate) fn process_scheduled_task(
    weak: Weak<TrafficSocket>,
    task: IoTask,
    continue_fn: ContinueFn,
) {
    let Some(socket) = weak.upgrade() else { return };
    let pattern = socket.pattern();

    socket.increment_io();
    let outcome = process_task(&socket, &pattern, task, continue_fn);
    if !outcome.started {
        let remaining = socket.decrement_io();
        debug_assert!(remaining > 0, "scheduled io released the last count");
    }
    if !outcome.done {
        continue_fn(weak.clone());
    }
    // release the count held since scheduling
    if socket.decrement_io() == 0 {
        socket.complete_state(outcome.error);
    }
}
