//! Lock filter: per-calling-thread position and cache over one shared
//! upstream.
//!
//! Several threads can drive the same graph at different positions through
//! a single lock instance: each calling thread gets its own seek position
//! and recent-frame queue, while upstream access stays serialised under
//! the filter's mutex. The distributor splices these in at clone seams;
//! see `filters::distributor`.

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::node::{clamp_position, Node, NodeHandle, NodeKind, SlotTable};
use crate::property::{PropertyBag, PropertyValue};
use std::collections::HashMap;
use std::thread::{self, ThreadId};

const DEFAULT_QUEUE: usize = 50;

/// Per-thread seek/cache state.
struct ThreadState {
    position: i32,
    // Recency order, most recent at the back.
    recent: Vec<(i32, Frame)>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            position: 0,
            recent: Vec::new(),
        }
    }

    fn lookup(&mut self, position: i32) -> Option<Frame> {
        let index = self.recent.iter().position(|(p, _)| *p == position)?;
        let entry = self.recent.remove(index);
        let frame = entry.1.clone();
        self.recent.push(entry);
        Some(frame)
    }

    fn remember(&mut self, position: i32, frame: Frame, capacity: usize) {
        if let Some(index) = self.recent.iter().position(|(p, _)| *p == position) {
            self.recent.remove(index);
        }
        self.recent.push((position, frame));
        while self.recent.len() > capacity.max(1) {
            self.recent.remove(0);
        }
    }
}

struct LockState {
    threads: HashMap<ThreadId, ThreadState>,
    frames: i32,
}

/// The lock filter (URI `lock`).
///
/// Properties: `sync` (default 1) - when 0, `sync()` does not forward
/// upstream and the last synchronised count keeps being reported; `image`
/// (default 0) - when 1, the image payload is materialised before the
/// frame is handed back; `queue` (default 50) - per-thread cache bound.
pub struct LockFilter {
    properties: PropertyBag,
    slots: SlotTable,
    state: std::sync::Mutex<LockState>,
}

impl LockFilter {
    /// Create a lock filter.
    pub fn new() -> Self {
        let properties = PropertyBag::new();
        properties.append("sync", PropertyValue::Int(1));
        properties.append("image", PropertyValue::Int(0));
        properties.append("queue", PropertyValue::Int(DEFAULT_QUEUE as i64));
        Self {
            properties,
            slots: SlotTable::new(1),
            state: std::sync::Mutex::new(LockState {
                threads: HashMap::new(),
                frames: 0,
            }),
        }
    }
}

impl Default for LockFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for LockFilter {
    fn uri(&self) -> String {
        "lock".to_string()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Filter
    }

    fn frames(&self) -> i32 {
        self.state.lock().unwrap().frames
    }

    /// Forwarded only while the `sync` property is non-zero; see the
    /// distributor's sync discipline for why it gets toggled.
    fn sync(&self) {
        let mut state = self.state.lock().unwrap();
        if self.properties.get_i64("sync").unwrap_or(1) != 0 {
            if let Some(upstream) = self.slots.get(0) {
                upstream.sync();
                state.frames = upstream.frames();
            }
        }
    }

    fn seek(&self, position: i32, relative: bool) {
        let mut state = self.state.lock().unwrap();
        let frames = state.frames;
        let entry = state
            .threads
            .entry(thread::current().id())
            .or_insert_with(ThreadState::new);
        let target = if relative {
            entry.position + position
        } else {
            position
        };
        entry.position = clamp_position(target, frames);
    }

    fn position(&self) -> i32 {
        let state = self.state.lock().unwrap();
        state
            .threads
            .get(&thread::current().id())
            .map(|t| t.position)
            .unwrap_or(0)
    }

    fn fetch(&self) -> Result<Frame> {
        let frame = {
            let mut state = self.state.lock().unwrap();
            let capacity = self.properties.get_i64("queue").unwrap_or(DEFAULT_QUEUE as i64) as usize;
            let thread_id = thread::current().id();
            let position = state
                .threads
                .get(&thread_id)
                .map(|t| t.position)
                .unwrap_or(0);

            let cached = state
                .threads
                .get_mut(&thread_id)
                .and_then(|t| t.lookup(position));

            match cached {
                Some(frame) => frame,
                None => {
                    // Upstream access happens with the lock held so a
                    // non-thread-safe graph only ever sees one caller.
                    let upstream = self.slots.get(0).ok_or_else(|| {
                        Error::GraphConnection("lock has no upstream".to_string())
                    })?;
                    upstream.seek(position, false);
                    let frame = upstream.fetch()?;
                    state
                        .threads
                        .entry(thread_id)
                        .or_insert_with(ThreadState::new)
                        .remember(position, frame.clone(), capacity);
                    frame
                }
            }
        };

        if self.properties.get_i64("image").unwrap_or(0) == 1 {
            if let Some(image) = frame.image() {
                image.materialize();
            }
        }

        Ok(frame.shallow())
    }

    fn slot_count(&self) -> usize {
        1
    }

    fn connect(&self, upstream: NodeHandle, slot: usize) -> bool {
        let connected = self.slots.connect(upstream.clone(), slot);
        if connected && slot == 0 {
            // Adopt the upstream's count immediately so seeks clamp sanely
            // before the first explicit sync.
            upstream.sync();
            self.state.lock().unwrap().frames = upstream.frames();
        }
        connected
    }

    fn slot(&self, index: usize) -> Option<NodeHandle> {
        self.slots.get(index)
    }

    fn properties(&self) -> PropertyBag {
        self.properties.clone()
    }

    /// The lock is the thread-safety boundary: whatever sits upstream, the
    /// graph below this point is safe for concurrent callers.
    fn is_thread_safe(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for LockFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("LockFilter")
            .field("frames", &state.frames)
            .field("threads", &state.threads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::TestPatternInput;
    use std::sync::Arc;

    fn locked_test_input() -> Arc<LockFilter> {
        let lock = Arc::new(LockFilter::new());
        lock.connect(Arc::new(TestPatternInput::new("test:")), 0);
        lock
    }

    #[test]
    fn test_positions_are_per_thread() {
        let lock = locked_test_input();

        lock.seek(10, false);
        let other = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                lock.seek(20, false);
                lock.fetch().unwrap().position()
            })
        };

        assert_eq!(lock.fetch().unwrap().position(), 10);
        assert_eq!(other.join().unwrap(), 20);
        // This thread's position is untouched by the other thread's seek.
        assert_eq!(lock.position(), 10);
    }

    #[test]
    fn test_sync_zero_freezes_count() {
        let lock = locked_test_input();
        assert_eq!(lock.frames(), 250);

        let upstream = lock.slot(0).unwrap();
        upstream.properties().assign("frames", "300").unwrap();

        lock.properties().assign("sync", "0").unwrap();
        lock.sync();
        assert_eq!(lock.frames(), 250);

        lock.properties().assign("sync", "1").unwrap();
        lock.sync();
        assert_eq!(lock.frames(), 300);
    }

    #[test]
    fn test_cache_hit_skips_upstream() {
        let lock = locked_test_input();
        lock.seek(5, false);
        let first = lock.fetch().unwrap();
        // Same position again: served from the per-thread queue.
        let second = lock.fetch().unwrap();
        assert_eq!(first.position(), second.position());
    }

    #[test]
    fn test_image_property_forces_materialisation() {
        let lock = locked_test_input();
        lock.seek(0, false);
        assert!(!lock.fetch().unwrap().image().unwrap().is_materialized());

        lock.properties().assign("image", "1").unwrap();
        lock.seek(1, false);
        assert!(lock.fetch().unwrap().image().unwrap().is_materialized());
    }
}
