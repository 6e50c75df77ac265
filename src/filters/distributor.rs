//! Distributor filter: parallel frame production over cloned graphs.
//!
//! Wraps one upstream graph, clones it once per worker thread (splicing
//! [`LockFilter`] boundaries at the seams that must stay shared), and fans
//! predicted frame requests out to a pool. Results land in an LRU keyed by
//! position; the calling thread blocks (bounded) on the position it wants.
//! Each position is computed at most once at a time.

use crate::error::{Error, Result};
use crate::factory::NodeFactory;
use crate::filters::LockFilter;
use crate::frame::Frame;
use crate::node::{Node, NodeBase, NodeHandle, NodeKind, SlotTable};
use crate::property::{PropertyBag, PropertyValue};
use crate::runtime::{FrameCache, ThreadPool};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MONITOR_TICK: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Filter URIs that are never duplicated: a lock boundary is spliced in so
/// every clone shares the one instance. Deferred-evaluation decoders and
/// nested distributors manage their own subgraphs; tees are explicit
/// fan-out points.
const SHARED_URIS: [&str; 3] = ["decode", "distributor", "tee"];

/// The distributor filter (URI `distributor`).
///
/// Properties:
/// - `threads` - worker count; negative means hardware concurrency,
///   0 disables threading (default 1)
/// - `queue` - result cache size and prediction window (default 25)
/// - `active` - 0 routes every fetch through the synchronous path
/// - `audio_direction` - enable reverse-audio fix-up (default 1)
/// - `trigger` - payload bitmask materialised by workers: 1 image,
///   2 stream, 4 audio (default 1)
/// - `timeout` - caller wait bound in milliseconds (default 5000)
/// - `idle` - idle release period in milliseconds (default 5000)
pub struct DistributorFilter {
    inner: Arc<Inner>,
}

struct Inner {
    base: NodeBase,
    slots: SlotTable,
    factory: Arc<dyn NodeFactory>,
    engine: Mutex<Engine>,
    graphs: Graphs,
    cache: FrameCache,
    weak_self: Weak<Inner>,
}

struct Engine {
    pool: Option<ThreadPool>,
    initialised: bool,
    runnable: bool,
    expected: i32,
    direction: i32,
    previous: i32,
    last_used: Instant,
    monitor: bool,
}

#[derive(Default)]
struct Graphs {
    state: Mutex<GraphsState>,
}

#[derive(Default)]
struct GraphsState {
    clones: Vec<NodeHandle>,
    scheduled: HashSet<i32>,
}

impl Graphs {
    fn schedule(&self, position: i32) {
        self.state.lock().unwrap().scheduled.insert(position);
    }

    fn scheduled(&self, position: i32) -> bool {
        self.state.lock().unwrap().scheduled.contains(&position)
    }

    fn clear_schedule(&self) {
        self.state.lock().unwrap().scheduled.clear();
    }

    fn push_clone(&self, clone: NodeHandle) {
        self.state.lock().unwrap().clones.push(clone);
    }

    fn take_clone(&self) -> Option<NodeHandle> {
        self.state.lock().unwrap().clones.pop()
    }

    fn return_clone(&self, clone: NodeHandle, position: i32) {
        let mut state = self.state.lock().unwrap();
        state.clones.push(clone);
        state.scheduled.remove(&position);
    }

    fn unschedule(&self, position: i32) {
        self.state.lock().unwrap().scheduled.remove(&position);
    }

    fn clear_clones(&self) {
        self.state.lock().unwrap().clones.clear();
    }

    fn sync_clones(&self) {
        let clones = self.state.lock().unwrap().clones.clone();
        for clone in clones {
            clone.sync();
        }
    }

    fn has_clones(&self) -> bool {
        !self.state.lock().unwrap().clones.is_empty()
    }
}

impl DistributorFilter {
    /// Create a distributor; the factory is used to clone filters.
    pub fn new(factory: Arc<dyn NodeFactory>) -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            base: NodeBase::new(),
            slots: SlotTable::new(1),
            factory,
            engine: Mutex::new(Engine {
                pool: None,
                initialised: false,
                runnable: true,
                expected: -1,
                direction: 1,
                previous: 0,
                last_used: Instant::now(),
                monitor: false,
            }),
            graphs: Graphs::default(),
            cache: FrameCache::new(25),
            weak_self: weak.clone(),
        });

        let props = inner.base.properties();
        props.append("threads", PropertyValue::Int(1));
        props.append("queue", PropertyValue::Int(25));
        props.append("active", PropertyValue::Int(1));
        props.append("audio_direction", PropertyValue::Int(1));
        props.append("trigger", PropertyValue::Int(1));
        props.append("timeout", PropertyValue::Int(5000));
        props.append("idle", PropertyValue::Int(5000));

        Self { inner }
    }
}

impl Inner {
    fn prop(&self, name: &str, fallback: i64) -> i64 {
        self.base.properties().get_i64(name).unwrap_or(fallback)
    }

    fn worker_count(&self) -> usize {
        let threads = self.prop("threads", 1);
        if threads < 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            threads as usize
        }
    }

    /// Decide threaded vs synchronous operation, initialising on first use.
    fn ensure_engine(&self) -> Result<bool> {
        let mut engine = self.engine.lock().unwrap();
        engine.last_used = Instant::now();

        let active = self.prop("active", 1) != 0;
        if active && !engine.initialised && engine.runnable {
            let threads = self.prop("threads", 1);
            let upstream = self
                .slots
                .get(0)
                .ok_or_else(|| Error::GraphConnection("distributor has no upstream".into()))?;
            if threads != 0 && graph_thread_safe(&upstream) {
                if !self.graphs.has_clones() {
                    self.clone_graphs(self.worker_count())?;
                }
                engine.runnable = true;
            } else {
                debug!("graph not thread safe, falling back to synchronous fetch");
                engine.runnable = false;
            }
            engine.initialised = true;
        }

        Ok(engine.initialised && engine.runnable && active)
    }

    /// Clone the upstream graph once per worker.
    ///
    /// The first pass splices lock boundaries into the original graph at
    /// every shared seam; later passes find those locks and reuse them, so
    /// all clones funnel through the same shared instances.
    fn clone_graphs(&self, count: usize) -> Result<()> {
        let count = count.max(1);
        for _ in 0..count {
            let upstream = self
                .slots
                .get(0)
                .ok_or_else(|| Error::GraphConnection("distributor has no upstream".into()))?;
            let clone = self.clone_walk(upstream, None, count)?;
            self.graphs.push_clone(clone);
        }
        debug!(count, "cloned upstream graph");
        Ok(())
    }

    fn clone_walk(
        &self,
        graph: NodeHandle,
        parent: Option<(NodeHandle, usize)>,
        total: usize,
    ) -> Result<NodeHandle> {
        let uri = graph.uri();
        let shared = graph.slot_count() == 0
            || SHARED_URIS.contains(&uri.as_str())
            || (uri == "store" && total != 1);

        if shared {
            let lock = Arc::new(LockFilter::new());
            lock.connect(graph, 0);
            let handle: NodeHandle = lock;
            match parent {
                Some((parent, slot)) => {
                    parent.connect(handle.clone(), slot);
                }
                None => {
                    self.slots.connect(handle.clone(), 0);
                }
            }
            Ok(handle)
        } else if uri == "lock" {
            Ok(graph)
        } else {
            let copy = self.factory.create_filter(&uri);
            copy.init()
                .map_err(|_| Error::GraphConnection(format!("cannot clone filter {uri}")))?;
            for index in 0..graph.slot_count() {
                let child = graph.slot(index).ok_or_else(|| {
                    Error::GraphConnection(format!("missing upstream in slot {index} of {uri}"))
                })?;
                let cloned = self.clone_walk(child, Some((graph.clone(), index)), total)?;
                copy.connect(cloned, index);
            }
            copy.properties().copy_from(&graph.properties());
            Ok(copy)
        }
    }

    /// Synchronous fetch-and-cache (non-thread-safe or inactive graphs).
    fn plain_fetch(&self, position: i32) -> Result<Frame> {
        self.cache.resize(self.prop("queue", 25) as usize);
        if let Some(frame) = self.cache.fetch(position) {
            return Ok(frame);
        }

        let upstream = self
            .slots
            .get(0)
            .ok_or_else(|| Error::GraphConnection("distributor has no upstream".into()))?;
        upstream.seek(position, false);
        let frame = upstream.fetch()?;
        self.apply_trigger(&frame);
        self.cache.append(position, frame.clone());
        Ok(frame)
    }

    /// Threaded fetch: schedule predictions, then wait for the position.
    fn threaded_fetch(&self, position: i32) -> Result<Frame> {
        let queue = self.prop("queue", 25).max(1) as i32;
        let timeout_ms = self.prop("timeout", 5000).max(0) as u64;
        self.cache.resize(queue as usize);

        {
            let mut engine = self.engine.lock().unwrap();
            self.acquire_pool(&mut engine);

            if engine.expected != position && !self.pending(position) {
                // Prediction miss: drop everything queued and fetch
                // exactly what was asked for.
                if let Some(pool) = &engine.pool {
                    pool.clear_pending();
                    pool.wait_idle(DRAIN_TIMEOUT);
                }
                self.graphs.clear_schedule();
                self.add_job(&mut engine, position);
                engine.direction = if position == engine.previous {
                    1
                } else {
                    position - engine.previous
                };
            } else if engine.expected == position {
                // Prediction hit: schedule outward in the play direction.
                let frames = self.slots.get(0).map(|u| u.frames()).unwrap_or(0);
                let half = queue / 2;
                let step = engine.direction;
                let low = (position - step.abs() * half).max(0);
                let high = (position + step.abs() * half).min(frames);
                let mut requested = position;
                while requested >= low && requested < high {
                    self.add_job(&mut engine, requested);
                    requested += step;
                }
            } else {
                engine.direction = if position == engine.previous {
                    1
                } else {
                    position - engine.previous
                };
            }
        }

        let frame = self.cache.wait(position, Duration::from_millis(timeout_ms));

        {
            let mut engine = self.engine.lock().unwrap();
            engine.previous = position;
            engine.expected = position + engine.direction;
        }

        frame.ok_or_else(|| {
            warn!(position, timeout_ms, "distributor wait expired");
            Error::SchedulingTimeout {
                position,
                timeout_ms,
            }
        })
    }

    fn pending(&self, position: i32) -> bool {
        self.graphs.scheduled(position) || self.cache.fetch(position).is_some()
    }

    fn add_job(&self, engine: &mut Engine, position: i32) {
        if self.pending(position) {
            return;
        }
        self.graphs.schedule(position);
        let inner = self.weak_self.upgrade().expect("inner alive during fetch");
        if let Some(pool) = &engine.pool {
            pool.submit(move || inner.decode_job(position));
        }
    }

    /// Worker-side: fetch one position on a borrowed clone and cache it.
    fn decode_job(&self, position: i32) {
        let Some(graph) = self.graphs.take_clone() else {
            // Released while the job was queued.
            self.graphs.unschedule(position);
            return;
        };

        graph.seek(position, false);
        let frame = match graph.fetch() {
            Ok(frame) => frame,
            Err(error) => {
                // Hard upstream failures become frame-level errors so the
                // waiting caller sees them instead of a bare timeout.
                let mut frame = Frame::new(position);
                frame.push_error(error.to_string(), "distributor");
                frame
            }
        };
        self.apply_trigger(&frame);
        self.cache.append(position, frame);
        self.graphs.return_clone(graph, position);
    }

    fn apply_trigger(&self, frame: &Frame) {
        let trigger = self.prop("trigger", 1);
        if trigger & 1 != 0 {
            if let Some(image) = frame.image() {
                image.materialize();
            }
        }
        if trigger & 2 != 0 {
            if let Some(stream) = frame.stream() {
                let _ = stream.bytes();
            }
        }
        if trigger & 4 != 0 {
            if let Some(audio) = frame.audio() {
                let _ = audio.samples();
            }
        }
    }

    fn acquire_pool(&self, engine: &mut Engine) {
        if engine.pool.is_none() {
            engine.pool = Some(ThreadPool::new(self.worker_count()));
        }
        engine.last_used = Instant::now();
        if !engine.monitor {
            engine.monitor = true;
            self.spawn_monitor();
        }
    }

    /// Idle monitor: releases the pool, clones and cache after `idle`
    /// milliseconds without a fetch, then exits. Respawned on next use.
    fn spawn_monitor(&self) {
        let weak: Weak<Inner> = self.weak_self.clone();
        std::thread::Builder::new()
            .name("distributor-monitor".to_string())
            .spawn(move || loop {
                std::thread::sleep(MONITOR_TICK);
                let Some(inner) = weak.upgrade() else { break };
                let idle = Duration::from_millis(inner.prop("idle", 5000).max(0) as u64);
                let mut engine = inner.engine.lock().unwrap();
                if engine.pool.is_none() {
                    engine.monitor = false;
                    break;
                }
                if engine.last_used.elapsed() > idle {
                    debug!("idle period expired, releasing distributor resources");
                    inner.release_locked(&mut engine);
                    engine.monitor = false;
                    break;
                }
            })
            .expect("failed to spawn distributor monitor");
    }

    fn release_locked(&self, engine: &mut Engine) {
        if let Some(pool) = engine.pool.take() {
            pool.clear_pending();
            drop(pool);
        }
        self.graphs.clear_schedule();
        self.graphs.clear_clones();
        self.cache.clear();
        engine.initialised = false;
    }

    /// Correct the audio sample order for reverse playback, flipping at
    /// most once per direction change per delivered frame.
    fn fix_audio_direction(&self, frame: &mut Frame) {
        if self.prop("audio_direction", 1) == 0 {
            return;
        }
        let direction = self.engine.lock().unwrap().direction;
        let props = frame.properties().clone();
        match props.get_i64("audio_reversed") {
            Some(reversed) => {
                if (reversed != 0 && direction >= 0) || (reversed == 0 && direction < 0) {
                    if let Some(audio) = frame.audio().map(|a| a.reversed()) {
                        frame.set_audio(audio);
                    }
                    props.set(
                        "audio_reversed",
                        PropertyValue::Int(if reversed != 0 { 0 } else { 1 }),
                    );
                }
            }
            None => {
                if direction < 0 {
                    if let Some(audio) = frame.audio().map(|a| a.reversed()) {
                        frame.set_audio(audio);
                    }
                }
                props.append(
                    "audio_reversed",
                    PropertyValue::Int(if direction < 0 { 1 } else { 0 }),
                );
            }
        }
    }

    /// Coherent resync across the original graph and every clone.
    ///
    /// The immediate upstream locks sync with their upstreams exactly once
    /// (sync forced to 1), then the clones resync against the now-frozen
    /// counts (sync forced to 0) so every clone reports the same total.
    fn sync_graphs(&self) {
        {
            let engine = self.engine.lock().unwrap();
            if let Some(pool) = &engine.pool {
                pool.clear_pending();
                pool.wait_idle(DRAIN_TIMEOUT);
            }
            self.graphs.clear_schedule();
        }

        if let Some(upstream) = self.slots.get(0) {
            set_lock_sync(&upstream, 1);
            upstream.sync();
            set_lock_sync(&upstream, 0);
        }
        self.graphs.sync_clones();
    }
}

/// Probe a graph for thread safety. A lock boundary vouches for whatever
/// sits above it.
fn graph_thread_safe(node: &NodeHandle) -> bool {
    if !node.is_thread_safe() {
        return false;
    }
    if node.uri() == "lock" {
        return true;
    }
    (0..node.slot_count()).all(|index| match node.slot(index) {
        Some(child) => graph_thread_safe(&child),
        None => false,
    })
}

/// Set the `sync` property on the first lock filter(s) found along each
/// path from `node`.
fn set_lock_sync(node: &NodeHandle, value: i64) {
    if node.uri() == "lock" {
        node.properties().set("sync", PropertyValue::Int(value));
        return;
    }
    for index in 0..node.slot_count() {
        if let Some(child) = node.slot(index) {
            set_lock_sync(&child, value);
        }
    }
}

impl Node for DistributorFilter {
    fn uri(&self) -> String {
        "distributor".to_string()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Filter
    }

    fn frames(&self) -> i32 {
        self.inner.slots.get(0).map(|u| u.frames()).unwrap_or(0)
    }

    fn sync(&self) {
        self.inner.sync_graphs();
    }

    fn seek(&self, position: i32, relative: bool) {
        self.inner.base.seek(position, relative, self.frames());
    }

    fn position(&self) -> i32 {
        self.inner.base.position()
    }

    fn fetch(&self) -> Result<Frame> {
        let position = self.inner.base.position();
        let threaded = self.inner.ensure_engine()?;
        let frame = if threaded {
            self.inner.threaded_fetch(position)?
        } else {
            self.inner.plain_fetch(position)?
        };

        let mut frame = frame.shallow();
        self.inner.fix_audio_direction(&mut frame);
        Ok(frame)
    }

    fn slot_count(&self) -> usize {
        1
    }

    fn connect(&self, upstream: NodeHandle, slot: usize) -> bool {
        let connected = self.inner.slots.connect(upstream, slot);
        if connected {
            // The graph changed shape: re-probe and re-clone on next use.
            let mut engine = self.inner.engine.lock().unwrap();
            self.inner.graphs.clear_clones();
            self.inner.graphs.clear_schedule();
            engine.initialised = false;
            engine.runnable = true;
        }
        connected
    }

    fn slot(&self, index: usize) -> Option<NodeHandle> {
        self.inner.slots.get(index)
    }

    fn properties(&self) -> PropertyBag {
        self.inner.base.properties()
    }

    fn is_thread_safe(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for DistributorFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engine = self.inner.engine.lock().unwrap();
        f.debug_struct("DistributorFilter")
            .field("initialised", &engine.initialised)
            .field("runnable", &engine.runnable)
            .field("direction", &engine.direction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::NodeRegistry;
    use crate::inputs::TestPatternInput;

    fn distributor_over_test_input() -> DistributorFilter {
        let registry = NodeRegistry::standard();
        let distributor = DistributorFilter::new(registry);
        distributor.connect(Arc::new(TestPatternInput::new("test:")), 0);
        distributor
    }

    #[test]
    fn test_sequential_fetches() {
        let distributor = distributor_over_test_input();
        for position in 0..20 {
            distributor.seek(position, false);
            let frame = distributor.fetch().unwrap();
            assert_eq!(frame.position(), position);
            assert!(!frame.in_error());
        }
    }

    #[test]
    fn test_input_gets_lock_boundary() {
        let distributor = distributor_over_test_input();
        distributor.seek(0, false);
        distributor.fetch().unwrap();
        // The original upstream slot now holds the spliced lock.
        assert_eq!(distributor.slot(0).unwrap().uri(), "lock");
    }

    #[test]
    fn test_unsafe_graph_falls_back() {
        let registry = NodeRegistry::standard();
        let distributor = DistributorFilter::new(registry);
        let input = Arc::new(TestPatternInput::new("test:"));
        input.properties().assign("threadsafe", "0").unwrap();
        distributor.connect(input, 0);

        distributor.seek(3, false);
        let frame = distributor.fetch().unwrap();
        assert_eq!(frame.position(), 3);
        // No lock was spliced: the graph was never cloned.
        assert_eq!(distributor.slot(0).unwrap().uri(), "test:");
    }

    #[test]
    fn test_reverse_audio_flips_once() {
        let distributor = distributor_over_test_input();

        // Establish forward direction, then walk backwards.
        distributor.seek(10, false);
        distributor.fetch().unwrap();
        distributor.seek(9, false);
        distributor.fetch().unwrap();
        distributor.seek(8, false);
        let frame = distributor.fetch().unwrap();

        let audio = frame.audio().unwrap();
        // Reverse playback: samples for position 8 arrive back to front.
        assert_eq!(audio.samples()[0], 8 * 8 + 7);
        assert_eq!(frame.properties().get_i64("audio_reversed"), Some(1));
    }

    #[test]
    fn test_multiple_threads_share_schedule() {
        let distributor = Arc::new(distributor_over_test_input());
        distributor.seek(5, false);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let distributor = Arc::clone(&distributor);
                std::thread::spawn(move || distributor.fetch().unwrap().position())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 5);
        }
    }
}
