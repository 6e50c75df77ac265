//! Tee filter: an explicit fan-out point.
//!
//! Several downstream consumers can share one tee; the distributor never
//! duplicates it, so everything behind the tee is computed once. A
//! one-frame memo keeps two consumers at the same position from costing
//! two upstream fetches.

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::node::{Node, NodeBase, NodeHandle, NodeKind, SlotTable};
use crate::property::PropertyBag;
use std::sync::Mutex;

/// A pass-through marking a shared point in the graph.
#[derive(Debug)]
pub struct TeeFilter {
    base: NodeBase,
    slots: SlotTable,
    last: Mutex<Option<(i32, Frame)>>,
}

impl TeeFilter {
    /// Create a tee.
    pub fn new() -> Self {
        Self {
            base: NodeBase::new(),
            slots: SlotTable::new(1),
            last: Mutex::new(None),
        }
    }
}

impl Default for TeeFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for TeeFilter {
    fn uri(&self) -> String {
        "tee".to_string()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Filter
    }

    fn frames(&self) -> i32 {
        self.slots.get(0).map(|u| u.frames()).unwrap_or(0)
    }

    fn sync(&self) {
        if let Some(upstream) = self.slots.get(0) {
            upstream.sync();
        }
    }

    fn seek(&self, position: i32, relative: bool) {
        self.base.seek(position, relative, self.frames());
    }

    fn position(&self) -> i32 {
        self.base.position()
    }

    fn fetch(&self) -> Result<Frame> {
        let upstream = self
            .slots
            .get(0)
            .ok_or_else(|| Error::GraphConnection("tee has no upstream".to_string()))?;
        let position = self.base.position();

        let mut last = self.last.lock().unwrap();
        if let Some((cached_position, frame)) = last.as_ref() {
            if *cached_position == position {
                return Ok(frame.shallow());
            }
        }

        upstream.seek(position, false);
        let frame = upstream.fetch()?;
        *last = Some((position, frame.clone()));
        Ok(frame)
    }

    fn slot_count(&self) -> usize {
        1
    }

    fn connect(&self, upstream: NodeHandle, slot: usize) -> bool {
        self.slots.connect(upstream, slot)
    }

    fn slot(&self, index: usize) -> Option<NodeHandle> {
        self.slots.get(index)
    }

    fn properties(&self) -> PropertyBag {
        self.base.properties()
    }
}
