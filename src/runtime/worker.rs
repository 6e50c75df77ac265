//! Background worker for recurring, delay-scheduled jobs.
//!
//! One thread owns the schedule; callers talk to it over a control
//! channel. A job runs, reports whether it wants another go, and sleeps
//! for its preferred delay. Cancellation is acknowledged between runs, so
//! a bounded wait on the ack tells the caller the job is really gone.

use crate::error::{Error, Result};
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A unit of recurring background work.
pub trait BackgroundJob: Send + Sync {
    /// Run one tick. Return true to be rescheduled after [`Self::delay`].
    fn run_once(&self) -> bool;

    /// Preferred delay between runs.
    fn delay(&self) -> Duration;

    /// Short description for logging.
    fn describe(&self) -> String {
        "background job".to_string()
    }
}

/// Identifier for an enrolled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

enum Control {
    Add(JobId, Arc<dyn BackgroundJob>),
    Cancel(JobId, Sender<()>),
    Stop(Sender<()>),
}

/// The background worker thread plus its control channel.
pub struct Worker {
    control: Sender<Control>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Start the worker thread.
    pub fn start() -> Self {
        let (control, inbox) = kanal::unbounded::<Control>();
        let thread = std::thread::Builder::new()
            .name("moviola-worker".to_string())
            .spawn(move || run_schedule(inbox))
            .expect("failed to spawn background worker");
        Self {
            control,
            next_id: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Enrol a job; its first run happens after one delay.
    pub fn add(&self, job: Arc<dyn BackgroundJob>) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!(job = %job.describe(), "enrolling background job");
        let _ = self.control.send(Control::Add(id, job));
        id
    }

    /// Cancel a job, waiting (bounded) for the worker to drop it.
    pub fn cancel(&self, id: JobId, timeout: Duration) -> Result<()> {
        let (ack, done) = kanal::bounded::<()>(1);
        if self.control.send(Control::Cancel(id, ack)).is_err() {
            // Worker already gone; nothing left to cancel.
            return Ok(());
        }
        match done.recv_timeout(timeout) {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::JobCancelTimeout(format!("job {id:?}"))),
        }
    }

    /// Stop the worker, waiting (bounded) for the thread to wind down.
    /// Returns false if the wait expired.
    pub fn stop(&self, timeout: Duration) -> bool {
        let (ack, done) = kanal::bounded::<()>(1);
        if self.control.send(Control::Stop(ack)).is_ok() && done.recv_timeout(timeout).is_err() {
            warn!("background worker did not stop within {timeout:?}");
            return false;
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop(Duration::from_millis(100));
    }
}

struct Scheduled {
    id: JobId,
    job: Arc<dyn BackgroundJob>,
    next: Instant,
}

fn run_schedule(inbox: Receiver<Control>) {
    let mut jobs: Vec<Scheduled> = Vec::new();

    loop {
        let wait = jobs
            .iter()
            .map(|j| j.next.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(Duration::from_secs(60));

        match inbox.recv_timeout(wait) {
            Ok(Control::Add(id, job)) => {
                let next = Instant::now() + job.delay();
                jobs.push(Scheduled { id, job, next });
            }
            Ok(Control::Cancel(id, ack)) => {
                jobs.retain(|j| j.id != id);
                let _ = ack.send(());
            }
            Ok(Control::Stop(ack)) => {
                let _ = ack.send(());
                return;
            }
            Err(ReceiveErrorTimeout::Timeout) => {}
            Err(_) => return,
        }

        let now = Instant::now();
        let mut index = 0;
        while index < jobs.len() {
            if jobs[index].next <= now {
                let reschedule = jobs[index].job.run_once();
                if reschedule {
                    let delay = jobs[index].job.delay();
                    jobs[index].next = Instant::now() + delay;
                    index += 1;
                } else {
                    let job = jobs.remove(index);
                    debug!(job = %job.job.describe(), "background job finished");
                }
            } else {
                index += 1;
            }
        }
    }
}
