//! Send-rate throttling.
//!
//! The quantum limiter accounts bytes against fixed-length time windows. A
//! send that fits in the current window goes out immediately; once the window
//! quota is spent, sends are pushed into the quantum where their bytes fit,
//! which keeps observed throughput at the target with at most one quantum of
//! burstiness.

use std::time::Instant;

/// Millisecond monotonic clock, injectable for tests.
pub type ClockFn = Box<dyn Fn() -> u64 + Send>;

pub fn monotonic_clock() -> ClockFn {
    let start = Instant::now();
    Box::new(move || start.elapsed().as_millis() as u64)
}

pub enum RateLimiter {
    /// No throttling: every send goes out immediately.
    None,
    Quantum(QuantumLimiter),
}

impl RateLimiter {
    pub fn new(bytes_per_second: Option<u64>, quantum_ms: u64) -> Self {
        match bytes_per_second {
            None | Some(0) => RateLimiter::None,
            Some(rate) => {
                RateLimiter::Quantum(QuantumLimiter::new(rate, quantum_ms, monotonic_clock()))
            }
        }
    }

    /// Delay in milliseconds before a send of `buffer_size` bytes may be
    /// issued. Always zero for non-send tasks and for the no-throttle policy.
    pub fn schedule_send(&mut self, buffer_size: u64) -> u64 {
        match self {
            RateLimiter::None => 0,
            RateLimiter::Quantum(limiter) => limiter.schedule_send(buffer_size),
        }
    }
}

pub struct QuantumLimiter {
    bytes_per_quantum: u64,
    quantum_ms: u64,
    bytes_sent_this_quantum: u64,
    quantum_start_ms: u64,
    clock: ClockFn,
}

impl QuantumLimiter {
    pub fn new(bytes_per_second: u64, quantum_ms: u64, clock: ClockFn) -> Self {
        let quantum_ms = quantum_ms.max(1);
        Self {
            bytes_per_quantum: (bytes_per_second * quantum_ms / 1000).max(1),
            quantum_ms,
            bytes_sent_this_quantum: 0,
            quantum_start_ms: clock(),
            clock,
        }
    }

    fn next_quantum_start(&self) -> u64 {
        self.quantum_start_ms
            + self.bytes_sent_this_quantum / self.bytes_per_quantum * self.quantum_ms
    }

    pub fn schedule_send(&mut self, buffer_size: u64) -> u64 {
        let now = (self.clock)();

        if self.bytes_sent_this_quantum < self.bytes_per_quantum {
            if now < self.quantum_start_ms + self.quantum_ms {
                if now >= self.quantum_start_ms {
                    // inside the current quantum with quota left
                    self.bytes_sent_this_quantum += buffer_size;
                    0
                } else {
                    // still catching up to a prior quantum
                    let delay = self.next_quantum_start() - now;
                    self.bytes_sent_this_quantum += buffer_size;
                    delay
                }
            } else {
                // a new quantum has already begun: start over
                self.bytes_sent_this_quantum = buffer_size;
                self.quantum_start_ms = now;
                0
            }
        } else {
            // quota exhausted: push into the quantum where these bytes fit
            let new_start = self.next_quantum_start();
            if now < new_start {
                self.bytes_sent_this_quantum = buffer_size;
                self.quantum_start_ms = new_start;
                new_start - now
            } else {
                self.bytes_sent_this_quantum = buffer_size;
                self.quantum_start_ms = now;
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn test_clock() -> (Arc<AtomicU64>, ClockFn) {
        let now = Arc::new(AtomicU64::new(0));
        let clock_now = Arc::clone(&now);
        (now, Box::new(move || clock_now.load(Ordering::Relaxed)))
    }

    #[test]
    fn sends_within_quota_are_not_delayed() {
        // 1 MB/s over 100 ms quanta: 100,000 bytes per quantum
        let (_now, clock) = test_clock();
        let mut limiter = QuantumLimiter::new(1_000_000, 100, clock);
        for _ in 0..5 {
            assert_eq!(limiter.schedule_send(20_000), 0);
        }
    }

    #[test]
    fn send_beyond_quota_waits_for_the_next_quantum() {
        let (_now, clock) = test_clock();
        let mut limiter = QuantumLimiter::new(1_000_000, 100, clock);
        // five sends of 200,000 bytes fill ten quanta of quota
        for _ in 0..5 {
            limiter.schedule_send(200_000);
        }
        // 1,000,000 bytes accounted: the next send belongs 10 quanta out
        let delay = limiter.schedule_send(200_000);
        assert_eq!(delay, 1000);
    }

    #[test]
    fn first_overflow_send_delays_into_its_quantum() {
        let (_now, clock) = test_clock();
        let mut limiter = QuantumLimiter::new(1_000_000, 100, clock);
        assert_eq!(limiter.schedule_send(200_000), 0);
        // 200,000 accounted = two quanta worth; next send waits 200 ms
        let delay = limiter.schedule_send(100_000);
        assert_eq!(delay, 200);
    }

    #[test]
    fn a_fresh_quantum_resets_the_counters() {
        let (now, clock) = test_clock();
        let mut limiter = QuantumLimiter::new(1_000_000, 100, clock);
        assert_eq!(limiter.schedule_send(100_000), 0);
        // quota exhausted; jump past the next quantum boundary
        now.store(250, Ordering::Relaxed);
        assert_eq!(limiter.schedule_send(100_000), 0);
        // and the quantum re-anchored at the current time
        assert_eq!(limiter.schedule_send(50_000), 100);
    }

    #[test]
    fn sustained_rate_is_bounded_by_the_target() {
        // schedule 50 x 20,000-byte sends through a virtual clock and verify
        // the spread satisfies the 1 MB/s target
        let (now, clock) = test_clock();
        let mut limiter = QuantumLimiter::new(1_000_000, 100, clock);
        let mut virtual_ms = 0u64;
        let mut last_send_ms = 0u64;
        for _ in 0..50 {
            now.store(virtual_ms, Ordering::Relaxed);
            let delay = limiter.schedule_send(20_000);
            last_send_ms = virtual_ms + delay;
            virtual_ms = last_send_ms;
        }
        // 1,000,000 bytes in total; at 1 MB/s the last send cannot be
        // scheduled earlier than 900 ms (one quantum of burst allowed)
        assert!(last_send_ms >= 900, "last send at {last_send_ms} ms");
    }

    #[test]
    fn none_policy_never_delays() {
        let mut limiter = RateLimiter::new(None, 100);
        assert_eq!(limiter.schedule_send(u64::MAX / 2), 0);
        assert_eq!(limiter.schedule_send(u64::MAX / 2), 0);
    }
}
