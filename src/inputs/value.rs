//! Value-only nodes.
//!
//! The stack language represents scalars (numeric literals, `$` strings,
//! `depth?` results, arithmetic results) as frameless inputs whose URI *is*
//! the value. They never produce media; fetching one yields an empty frame.

use crate::error::Result;
use crate::frame::Frame;
use crate::node::{Node, NodeBase, NodeKind};
use crate::property::PropertyBag;

/// A node carrying a textual value as its identifier.
#[derive(Debug)]
pub struct ValueNode {
    base: NodeBase,
    value: String,
}

impl ValueNode {
    /// Create a value node.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            base: NodeBase::new(),
            value: value.into(),
        }
    }
}

impl Node for ValueNode {
    fn uri(&self) -> String {
        self.value.clone()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Input
    }

    fn frames(&self) -> i32 {
        0
    }

    fn seek(&self, position: i32, relative: bool) {
        self.base.seek(position, relative, self.frames());
    }

    fn position(&self) -> i32 {
        self.base.position()
    }

    fn fetch(&self) -> Result<Frame> {
        Ok(Frame::new(self.base.position()))
    }

    fn properties(&self) -> PropertyBag {
        self.base.properties()
    }
}
