//! The indexer: a process-scoped registry of background index jobs.
//!
//! One job exists per (resource URL, entry type) key, shared ref-counted
//! across every caller that requests it. Jobs poll on the background
//! worker: reading an existing AWI file as it grows, watching a bare
//! resource's size, or generating an index by driving a decode input.

use crate::error::{Error, Result};
use crate::factory::NodeFactory;
use crate::index::awi::{AwiGenerator, AwiParser, ENTRY_TYPE_VIDEO};
use crate::index::Index;
use crate::node::{Node, NodeHandle};
use crate::runtime::{BackgroundJob, JobId, Worker};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Consecutive non-growing polls before a poll-size job reports EOF.
pub const POLL_RETRIES: u32 = 60;

/// Bounded wait for a cancelled job to leave the worker.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-tick time budget for the generate-index job.
const GENERATE_BUDGET: Duration = Duration::from_millis(200);

const READ_DELAY: Duration = Duration::from_millis(1000);
const POLL_DELAY: Duration = Duration::from_millis(2000);
const GENERATE_DELAY: Duration = Duration::from_millis(50);

/// Registry key: resource plus (for v4 media) the stream entry type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    /// Resource URL.
    pub url: String,
    /// AWI v4 entry type (0 for single-stream indices).
    pub entry_type: u16,
}

/// The caller-facing view of an enrolled index job.
pub trait IndexItem: Send + Sync {
    /// The index being built/read, when the job has one.
    fn index(&self) -> Option<Arc<dyn Index>>;

    /// Byte size of the resource as far as the job knows.
    fn size(&self) -> i64;

    /// Whether the job has reached a terminal state (EOF).
    fn finished(&self) -> bool;
}

trait IndexerJob: IndexItem + BackgroundJob {}

struct Entry {
    item: Arc<dyn IndexerJob>,
    job_id: JobId,
    refs: usize,
}

/// The registry. Explicit lifecycle: create with [`Indexer::new`] (or
/// [`Indexer::with_factory`] to enable `index:` URLs), tear down with
/// [`Indexer::shutdown`]; a request after shutdown restarts the worker.
pub struct Indexer {
    state: Mutex<IndexerState>,
    factory: Option<Arc<dyn NodeFactory>>,
}

struct IndexerState {
    worker: Option<Worker>,
    entries: HashMap<IndexKey, Entry>,
}

impl Indexer {
    /// Create a registry without decode support.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IndexerState {
                worker: None,
                entries: HashMap::new(),
            }),
            factory: None,
        }
    }

    /// Create a registry that can also generate indices by decoding
    /// (`index:` URLs) through the given factory.
    pub fn with_factory(factory: Arc<dyn NodeFactory>) -> Self {
        Self {
            state: Mutex::new(IndexerState {
                worker: None,
                entries: HashMap::new(),
            }),
            factory: Some(factory),
        }
    }

    /// Request the index item for a key, creating and enrolling the job on
    /// first use. Fails with [`Error::IndexUnreadable`] when the resource
    /// yields neither frames nor a byte size.
    pub fn request(&self, url: &str, entry_type: u16) -> Result<Arc<dyn IndexItem>> {
        let key = IndexKey {
            url: url.to_string(),
            entry_type,
        };
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.refs += 1;
            return Ok(entry.item.clone());
        }

        let job = self.classify(url, entry_type)?;
        let has_frames = job
            .index()
            .map(|index| index.total_frames() > 0)
            .unwrap_or(false);
        if !has_frames && job.size() <= 0 {
            return Err(Error::IndexUnreadable(url.to_string()));
        }

        let worker = state.worker.get_or_insert_with(Worker::start);
        let job_id = worker.add(job.clone());
        debug!(url, entry_type, "index job enrolled");
        state.entries.insert(
            key,
            Entry {
                item: job.clone(),
                job_id,
                refs: 1,
            },
        );
        Ok(job)
    }

    /// Drop one reference to a key; the last reference cancels the job
    /// (bounded wait) and erases the entry.
    pub fn cancel(&self, url: &str, entry_type: u16) -> Result<()> {
        let key = IndexKey {
            url: url.to_string(),
            entry_type,
        };
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.entries.get_mut(&key) else {
            return Ok(());
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(());
        }

        let entry = state.entries.remove(&key).expect("checked above");
        let worker_cancel = state
            .worker
            .as_ref()
            .map(|worker| worker.cancel(entry.job_id, CANCEL_TIMEOUT));
        drop(state);
        match worker_cancel {
            Some(Err(error)) => {
                warn!(url, "index job did not cancel in time");
                Err(error)
            }
            _ => Ok(()),
        }
    }

    /// Reference count for a key (0 when absent). Mostly for tests.
    pub fn references(&self, url: &str, entry_type: u16) -> usize {
        let key = IndexKey {
            url: url.to_string(),
            entry_type,
        };
        self.state
            .lock()
            .unwrap()
            .entries
            .get(&key)
            .map(|entry| entry.refs)
            .unwrap_or(0)
    }

    /// Stop the worker (bounded wait) and clear the registry. The next
    /// request starts fresh.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(worker) = state.worker.take() {
            worker.stop(CANCEL_TIMEOUT);
        }
        state.entries.clear();
    }

    /// Decide which kind of job a resource needs.
    fn classify(&self, url: &str, entry_type: u16) -> Result<Arc<dyn IndexerJob>> {
        if let Some(media) = url.strip_prefix("index:") {
            let factory = self
                .factory
                .as_ref()
                .ok_or_else(|| Error::IndexUnreadable(format!("{url}: no decode factory")))?;
            let input = factory.create_input(media);
            input.init()?;
            return Ok(Arc::new(GenerateIndexJob::new(url, input)));
        }

        if let Some(job) = ReadIndexJob::probe(url, entry_type) {
            return Ok(Arc::new(job));
        }

        Ok(Arc::new(PollSizeJob::new(url)))
    }
}

impl Default for Indexer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Read-index job
// ---------------------------------------------------------------------------

/// Reads an existing AWI file incrementally, tolerating growth.
struct ReadIndexJob {
    url: String,
    state: Mutex<ReadState>,
    index: Arc<dyn Index>,
}

struct ReadState {
    parser: AwiParser,
    position: u64,
}

impl ReadIndexJob {
    /// Try successive format versions, newest first. A version fits when
    /// the initial read yields a valid parse with at least one frame.
    fn probe(url: &str, entry_type: u16) -> Option<Self> {
        if !Path::new(url).is_file() {
            return None;
        }
        let entry_type = if entry_type == 0 { ENTRY_TYPE_VIDEO } else { entry_type };
        for parser in [AwiParser::v4(entry_type), AwiParser::v3(), AwiParser::v2()] {
            let index = parser.index();
            let mut state = ReadState {
                parser,
                position: 0,
            };
            if read_pending(url, &mut state) && index.total_frames() > 0 {
                return Some(Self {
                    url: url.to_string(),
                    state: Mutex::new(state),
                    index: Arc::new(index),
                });
            }
        }
        None
    }
}

/// Read newly appended bytes from the current offset through the parser.
fn read_pending(url: &str, state: &mut ReadState) -> bool {
    let Ok(mut file) = File::open(url) else {
        // Transient: the file may reappear.
        return true;
    };
    if file.seek(SeekFrom::Start(state.position)).is_err() {
        return true;
    }
    let mut chunk = [0u8; 16384];
    loop {
        match file.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(actual) => {
                state.position += actual as u64;
                if !state.parser.parse(&chunk[..actual]) {
                    return false;
                }
            }
        }
    }
    true
}

impl IndexItem for ReadIndexJob {
    fn index(&self) -> Option<Arc<dyn Index>> {
        Some(self.index.clone())
    }

    fn size(&self) -> i64 {
        self.index.bytes()
    }

    fn finished(&self) -> bool {
        self.index.finished()
    }
}

impl BackgroundJob for ReadIndexJob {
    fn run_once(&self) -> bool {
        if self.finished() {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        read_pending(&self.url, &mut state);
        !self.finished()
    }

    fn delay(&self) -> Duration {
        READ_DELAY
    }

    fn describe(&self) -> String {
        format!("read-index {}", self.url)
    }
}

impl IndexerJob for ReadIndexJob {}

// ---------------------------------------------------------------------------
// Poll-size job
// ---------------------------------------------------------------------------

/// Watches an unindexed resource's size; EOF after [`POLL_RETRIES`]
/// consecutive polls without growth.
struct PollSizeJob {
    url: String,
    state: Mutex<PollState>,
}

struct PollState {
    size: i64,
    misses: u32,
    finished: bool,
}

impl PollSizeJob {
    fn new(url: &str) -> Self {
        let job = Self {
            url: url.to_string(),
            state: Mutex::new(PollState {
                size: 0,
                misses: 0,
                finished: false,
            }),
        };
        job.check_size();
        job
    }

    fn check_size(&self) {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            return;
        }
        let Ok(metadata) = std::fs::metadata(&self.url) else {
            return;
        };
        let bytes = metadata.len() as i64;
        if bytes > state.size {
            state.size = bytes;
            state.misses = 0;
        } else {
            state.misses += 1;
            if state.misses >= POLL_RETRIES {
                state.finished = true;
            }
        }
    }

    #[cfg(test)]
    fn misses(&self) -> u32 {
        self.state.lock().unwrap().misses
    }
}

impl IndexItem for PollSizeJob {
    fn index(&self) -> Option<Arc<dyn Index>> {
        None
    }

    fn size(&self) -> i64 {
        self.state.lock().unwrap().size
    }

    fn finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }
}

impl BackgroundJob for PollSizeJob {
    fn run_once(&self) -> bool {
        self.check_size();
        !self.finished()
    }

    fn delay(&self) -> Duration {
        POLL_DELAY
    }

    fn describe(&self) -> String {
        format!("poll-size {}", self.url)
    }
}

impl IndexerJob for PollSizeJob {}

// ---------------------------------------------------------------------------
// Generate-index job
// ---------------------------------------------------------------------------

/// Drives a decode-capable input frame by frame, enrolling key frames and
/// detailing the rest, within a per-tick time budget.
struct GenerateIndexJob {
    url: String,
    state: Mutex<GenerateState>,
    index: Arc<dyn Index>,
}

struct GenerateState {
    input: Option<NodeHandle>,
    generator: AwiGenerator,
    position: i32,
    end_offset: i64,
}

impl GenerateIndexJob {
    fn new(url: &str, input: NodeHandle) -> Self {
        let generator = AwiGenerator::v2();
        let index: Arc<dyn Index> = Arc::new(generator.index());
        let job = Self {
            url: url.to_string(),
            state: Mutex::new(GenerateState {
                input: Some(input),
                generator,
                position: 0,
                end_offset: 0,
            }),
            index,
        };
        // Register the first frames up front so the request gate sees a
        // usable index.
        job.run_once();
        job
    }
}

impl IndexItem for GenerateIndexJob {
    fn index(&self) -> Option<Arc<dyn Index>> {
        Some(self.index.clone())
    }

    fn size(&self) -> i64 {
        self.index.bytes()
    }

    fn finished(&self) -> bool {
        self.index.finished()
    }
}

impl BackgroundJob for GenerateIndexJob {
    fn run_once(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(input) = state.input.clone() else {
            return false;
        };

        let started = Instant::now();
        let mut registered = 0;
        loop {
            input.sync();
            let total = input.frames();
            if state.position >= total {
                // The source reports itself complete: close with the final
                // frame count and byte size, release the input.
                let (position, end_offset) = (state.position, state.end_offset);
                state.generator.close(position, end_offset);
                state.input = None;
                debug!(url = %self.url, frames = state.position, "index generation complete");
                return false;
            }

            input.seek(state.position, false);
            match input.fetch() {
                Ok(frame) => {
                    if let Some(stream) = frame.stream() {
                        if stream.key {
                            state.generator.enroll(state.position, stream.offset);
                        }
                        state
                            .generator
                            .detail(state.position, stream.offset, stream.length);
                        state.end_offset = stream.offset + stream.length as i64;
                    }
                    state.position += 1;
                    registered += 1;
                }
                Err(error) => {
                    warn!(url = %self.url, position = state.position, %error, "decode failed during index generation");
                    return true;
                }
            }

            if registered > 0 && started.elapsed() > GENERATE_BUDGET {
                return true;
            }
        }
    }

    fn delay(&self) -> Duration {
        GENERATE_DELAY
    }

    fn describe(&self) -> String {
        format!("generate-index {}", self.url)
    }
}

impl IndexerJob for GenerateIndexJob {}
