//! Completion job pool.
//!
//! Completion callbacks run on a small pool of worker threads fed through a
//! channel, so completions for different connections execute in parallel.
//! Per-connection ordering comes from the pattern lock, not from here.

use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};

type Job = Box<dyn FnOnce() + Send>;

pub struct JobPool {
    tx: Option<Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl JobPool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|id| {
                let rx: Receiver<Job> = rx.clone();
                thread::Builder::new()
                    .name(format!("completion-{id}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn completion worker")
            })
            .collect();
        Self { tx: Some(tx), workers }
    }

    /// Queue a job; drops it silently if the pool is shutting down.
    pub fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }
}

impl Drop for JobPool {
    fn drop(&mut self) {
        // closing the channel lets the workers drain and exit
        drop(self.tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_on_workers() {
        let pool = JobPool::new(2);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let count = Arc::clone(&count);
            pool.execute(Box::new(move || {
                count.fetch_add(1, Ordering::Relaxed);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::Relaxed) < 16 {
            assert!(std::time::Instant::now() < deadline, "jobs did not drain");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn drop_drains_outstanding_jobs() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let pool = JobPool::new(1);
            for _ in 0..8 {
                let count = Arc::clone(&count);
                pool.execute(Box::new(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                }));
            }
        }
        assert_eq!(count.load(Ordering::Relaxed), 8);
    }
}
