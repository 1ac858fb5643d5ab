//! One-shot and recurring timers.
//!
//! A single timer thread owns a deadline heap. One-shot jobs serve rate-limit
//! deferrals and state-machine transitions; recurring jobs serve the broker
//! tick and status updates. Jobs run on the timer thread and are expected to
//! be short - anything heavier should bounce through the job pool.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

enum TimerKind {
    Once(Box<dyn FnOnce() + Send>),
    /// Re-armed each firing while the job returns true.
    Recurring {
        job: Box<dyn FnMut() -> bool + Send>,
        period: Duration,
    },
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    kind: TimerKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    // inverted so the BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    stopped: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

pub struct Timer {
    shared: std::sync::Arc<TimerShared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Timer {
    pub fn spawn() -> std::sync::Arc<Timer> {
        let shared = std::sync::Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = std::sync::Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || run(thread_shared))
            .expect("failed to spawn timer thread");
        std::sync::Arc::new(Timer {
            shared,
            thread: Some(thread),
        })
    }

    /// Run `job` once after `delay`.
    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        self.push(delay, TimerKind::Once(Box::new(job)));
    }

    /// Run `job` every `period` until it returns false.
    pub fn schedule_recurring(
        &self,
        period: Duration,
        job: impl FnMut() -> bool + Send + 'static,
    ) {
        self.push(
            period,
            TimerKind::Recurring {
                job: Box::new(job),
                period,
            },
        );
    }

    fn push(&self, delay: Duration, kind: TimerKind) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            seq,
            kind,
        });
        drop(state);
        self.shared.cond.notify_one();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.heap.clear();
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: std::sync::Arc<TimerShared>) {
    loop {
        let mut due = Vec::new();
        {
            let mut state = shared.state.lock();
            loop {
                if state.stopped {
                    return;
                }
                let now = Instant::now();
                match state.heap.peek() {
                    Some(entry) if entry.deadline <= now => {
                        due.push(state.heap.pop().unwrap());
                        // drain everything that is due before releasing the lock
                        continue;
                    }
                    Some(entry) => {
                        if !due.is_empty() {
                            break;
                        }
                        let deadline = entry.deadline;
                        shared.cond.wait_until(&mut state, deadline);
                    }
                    None => {
                        if !due.is_empty() {
                            break;
                        }
                        shared.cond.wait(&mut state);
                    }
                }
            }
        }

        for entry in due {
            match entry.kind {
                TimerKind::Once(job) => job(),
                TimerKind::Recurring { mut job, period } => {
                    if job() {
                        let mut state = shared.state.lock();
                        if !state.stopped {
                            let seq = state.next_seq;
                            state.next_seq += 1;
                            state.heap.push(TimerEntry {
                                deadline: Instant::now() + period,
                                seq,
                                kind: TimerKind::Recurring { job, period },
                            });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn one_shot_fires_once() {
        let timer = Timer::spawn();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        timer.schedule(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        thread::sleep(Duration::from_millis(200));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn recurring_fires_until_cancelled() {
        let timer = Timer::spawn();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        timer.schedule_recurring(Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::Relaxed) < 2
        });
        thread::sleep(Duration::from_millis(300));
        // fired three times: the third call returned false and cancelled
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn earliest_deadline_fires_first() {
        let timer = Timer::spawn();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        timer.schedule(Duration::from_millis(50), move || o1.lock().push(2));
        timer.schedule(Duration::from_millis(10), move || o2.lock().push(1));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn drop_stops_pending_jobs() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let timer = Timer::spawn();
            let c = Arc::clone(&count);
            timer.schedule(Duration::from_secs(60), move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }
}
