//! Fixed-size worker pool over a shared job deque.
//!
//! Built for the distributor's needs: pending jobs can be cleared wholesale
//! when a seek invalidates the prediction, and the owner can wait (bounded)
//! for in-flight jobs to drain before reconfiguring.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send>;

/// A fixed-size pool of worker threads.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Vec<JoinHandle<()>>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    job_ready: Condvar,
    idle: Condvar,
}

struct PoolState {
    jobs: VecDeque<Job>,
    active: usize,
    shutdown: bool,
}

impl ThreadPool {
    /// Spawn a pool with `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let threads = threads.max(1);
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            job_ready: Condvar::new(),
            idle: Condvar::new(),
        });

        let workers = (0..threads)
            .map(|index| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("pool-worker-{index}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        debug!(threads, "thread pool started");
        Self { inner, workers }
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job for execution.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            return;
        }
        state.jobs.push_back(Box::new(job));
        drop(state);
        self.inner.job_ready.notify_one();
    }

    /// Discard every job that has not started yet.
    pub fn clear_pending(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let dropped = state.jobs.len();
        state.jobs.clear();
        if dropped > 0 {
            debug!(dropped, "cleared pending jobs");
        }
        if state.active == 0 {
            drop(state);
            self.inner.idle.notify_all();
        }
    }

    /// Wait until no job is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        while !state.jobs.is_empty() || state.active > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self.inner.idle.wait_timeout(state, deadline - now).unwrap();
            state = next;
        }
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.shutdown = true;
            state.jobs.clear();
        }
        self.inner.job_ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("thread pool released");
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.active += 1;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = inner.job_ready.wait(state).unwrap();
            }
        };

        job();

        let mut state = inner.state.lock().unwrap();
        state.active -= 1;
        if state.jobs.is_empty() && state.active == 0 {
            drop(state);
            inner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jobs_run() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_clear_pending_drops_unstarted() {
        let pool = ThreadPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));

        // First job holds the single worker busy long enough for the rest
        // to stay queued.
        let gate = Arc::new(AtomicUsize::new(0));
        {
            let gate = Arc::clone(&gate);
            pool.submit(move || {
                while gate.load(Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            });
        }
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.clear_pending();
        gate.store(1, Ordering::SeqCst);
        assert!(pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_idle_timeout() {
        let pool = ThreadPool::new(1);
        pool.submit(|| thread::sleep(Duration::from_millis(200)));
        assert!(!pool.wait_idle(Duration::from_millis(10)));
        assert!(pool.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_minimum_one_thread() {
        let pool = ThreadPool::new(0);
        assert_eq!(pool.threads(), 1);
    }
}
