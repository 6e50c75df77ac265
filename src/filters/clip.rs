//! Clip filter: trims an upstream to an in/out range.

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::node::{Node, NodeBase, NodeHandle, NodeKind, SlotTable};
use crate::property::{PropertyBag, PropertyValue};

/// Presents frames `in..out` of the upstream as positions `0..(out-in)`.
///
/// Properties: `in` (default 0) and `out` (default -1, meaning the
/// upstream's end). Both are positions on the upstream.
#[derive(Debug)]
pub struct ClipFilter {
    base: NodeBase,
    slots: SlotTable,
}

impl ClipFilter {
    /// Create a clip filter with the full upstream range.
    pub fn new() -> Self {
        let filter = Self {
            base: NodeBase::new(),
            slots: SlotTable::new(1),
        };
        let props = filter.base.properties();
        props.append("in", PropertyValue::Int(0));
        props.append("out", PropertyValue::Int(-1));
        filter
    }

    fn range(&self, upstream_frames: i32) -> (i32, i32) {
        let props = self.base.properties();
        let start = props.get_i64("in").unwrap_or(0).max(0) as i32;
        let out = props.get_i64("out").unwrap_or(-1) as i32;
        let end = if out < 0 {
            upstream_frames
        } else {
            out.min(upstream_frames)
        };
        (start.min(end), end)
    }
}

impl Default for ClipFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for ClipFilter {
    fn uri(&self) -> String {
        "clip".to_string()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Filter
    }

    fn frames(&self) -> i32 {
        match self.slots.get(0) {
            Some(upstream) => {
                let (start, end) = self.range(upstream.frames());
                end - start
            }
            None => 0,
        }
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
            .ok_or_else(|| Error::GraphConnection("clip has no upstream".to_string()))?;
        let position = self.base.position();
        let (start, _) = self.range(upstream.frames());

        upstream.seek(start + position, false);
        let mut frame = upstream.fetch()?;
        frame.set_position(position);
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

    fn is_thread_safe(&self) -> bool {
        true
    }
}
