//! Bounded LRU frame cache with blocking waiters.
//!
//! Keyed by frame position. Consumers either hit the cache directly or
//! block (bounded) until a worker appends the position they need.

use crate::frame::Frame;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// An access-ordered LRU of position → frame with condvar waiters.
pub struct FrameCache {
    state: Mutex<CacheState>,
    available: Condvar,
}

struct CacheState {
    capacity: usize,
    // Recency order: the back is the most recently used.
    entries: Vec<(i32, Frame)>,
}

impl FrameCache {
    /// Create a cache bounded to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                capacity: capacity.max(1),
                entries: Vec::new(),
            }),
            available: Condvar::new(),
        }
    }

    /// Adjust the bound, evicting oldest entries if it shrank.
    pub fn resize(&self, capacity: usize) {
        let mut state = self.state.lock().unwrap();
        state.capacity = capacity.max(1);
        while state.entries.len() > state.capacity {
            state.entries.remove(0);
        }
    }

    /// Number of cached frames.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a position, refreshing its recency on a hit.
    pub fn fetch(&self, position: i32) -> Option<Frame> {
        let mut state = self.state.lock().unwrap();
        let index = state.entries.iter().position(|(p, _)| *p == position)?;
        let entry = state.entries.remove(index);
        let frame = entry.1.clone();
        state.entries.push(entry);
        Some(frame)
    }

    /// Insert a frame, evicting the least recently used beyond capacity,
    /// and wake any waiters.
    pub fn append(&self, position: i32, frame: Frame) {
        let mut state = self.state.lock().unwrap();
        if let Some(index) = state.entries.iter().position(|(p, _)| *p == position) {
            state.entries.remove(index);
        }
        state.entries.push((position, frame));
        while state.entries.len() > state.capacity {
            state.entries.remove(0);
        }
        drop(state);
        self.available.notify_all();
    }

    /// Block until `position` is cached or the timeout expires.
    pub fn wait(&self, position: i32, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(index) = state.entries.iter().position(|(p, _)| *p == position) {
                let entry = state.entries.remove(index);
                let frame = entry.1.clone();
                state.entries.push(entry);
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, result) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if result.timed_out() {
                // Re-check once after a timed-out wait before giving up.
                if let Some(index) = state.entries.iter().position(|(p, _)| *p == position) {
                    let frame = state.entries[index].1.clone();
                    return Some(frame);
                }
                return None;
            }
        }
    }

    /// Drop every cached frame.
    pub fn clear(&self) {
        self.state.lock().unwrap().entries.clear();
    }
}
