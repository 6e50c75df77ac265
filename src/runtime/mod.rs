//! Concurrency plumbing: the frame cache, the worker pool and the
//! background job worker.

mod cache;
mod pool;
mod worker;

pub use cache::FrameCache;
pub use pool::ThreadPool;
pub use worker::{BackgroundJob, JobId, Worker};
