//! Core node traits: the capability set shared by inputs, filters and
//! stores, and the helpers concrete nodes build on.
//!
//! A graph is nothing more than filters holding [`NodeHandle`]s in their
//! upstream slots. Connecting a slot is a pure graph edit; no work happens
//! until the next `fetch`.

use crate::error::Result;
use crate::frame::Frame;
use crate::property::PropertyBag;
use smallvec::SmallVec;
use std::sync::{Arc, Mutex};

/// The closed set of node capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Produces frames from an external resource (no upstream slots).
    Input,
    /// Transforms frames pulled from one or more upstream slots.
    Filter,
    /// Consumes frames (the terminal end of a graph).
    Store,
}

/// Shared handle to a node in the graph.
pub type NodeHandle = Arc<dyn Node>;

/// The capability trait implemented by every node.
///
/// Nodes are shared (`Arc`) and internally synchronised; all methods take
/// `&self`. `fetch` returns the frame for the node's current position and
/// is idempotent for a fixed position until upstream state changes.
/// Recoverable decode problems ride the returned frame's error list; hard
/// failures (missing upstream, malformed input) are `Err`.
pub trait Node: Send + Sync {
    /// The node's URI-like identifier.
    fn uri(&self) -> String;

    /// Which capability this node provides.
    fn kind(&self) -> NodeKind;

    /// Deferred initialisation; the point where lazily created nodes
    /// resolve or fail.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Total frame count. `0` means none known yet (a growing or empty
    /// source); re-query via [`Node::sync`], never infer.
    fn frames(&self) -> i32;

    /// Re-query the frame count from the underlying resource/upstream.
    fn sync(&self) {}

    /// Set the current position, absolute or relative, clamped into
    /// `[0, frames())` once the count is known.
    fn seek(&self, position: i32, relative: bool);

    /// The current position.
    fn position(&self) -> i32;

    /// Produce the frame for the current position.
    fn fetch(&self) -> Result<Frame>;

    /// Number of upstream slots (0 for inputs).
    fn slot_count(&self) -> usize {
        0
    }

    /// Connect an upstream into a slot. Returns false if the slot index
    /// is out of range.
    fn connect(&self, _upstream: NodeHandle, _slot: usize) -> bool {
        false
    }

    /// The upstream connected at `index`, if any.
    fn slot(&self, _index: usize) -> Option<NodeHandle> {
        None
    }

    /// The node's property bag (a shared handle).
    fn properties(&self) -> PropertyBag;

    /// Whether concurrent fetches on this node (and its upstreams) are
    /// safe. The distributor probes this before cloning.
    fn is_thread_safe(&self) -> bool {
        true
    }
}

/// Position + property state shared by most node implementations.
///
/// Keeps the clamped-seek rule in one place.
#[derive(Debug, Default)]
pub struct NodeBase {
    position: Mutex<i32>,
    properties: PropertyBag,
}

impl NodeBase {
    /// Create a base with an empty property bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// The property bag handle.
    pub fn properties(&self) -> PropertyBag {
        self.properties.clone()
    }

    /// Current position.
    pub fn position(&self) -> i32 {
        *self.position.lock().unwrap()
    }

    /// Apply a seek against the given frame count.
    pub fn seek(&self, position: i32, relative: bool, frames: i32) {
        let mut current = self.position.lock().unwrap();
        let target = if relative { *current + position } else { position };
        *current = clamp_position(target, frames);
    }
}

/// Clamp a position into the valid range for a frame count.
///
/// An unknown count (`frames <= 0`) only pins the lower bound; the upper
/// bound applies once the count is known.
pub fn clamp_position(position: i32, frames: i32) -> i32 {
    if position < 0 {
        0
    } else if frames > 0 && position >= frames {
        frames - 1
    } else {
        position
    }
}

/// Upstream slot table for filters.
#[derive(Default)]
pub struct SlotTable {
    slots: Mutex<SmallVec<[Option<NodeHandle>; 2]>>,
}

impl SlotTable {
    /// Create a table with `count` empty slots.
    pub fn new(count: usize) -> Self {
        let mut slots = SmallVec::new();
        slots.resize(count, None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Number of slots.
    pub fn count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Connect `upstream` into `slot`. Returns false when out of range.
    pub fn connect(&self, upstream: NodeHandle, slot: usize) -> bool {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(slot) {
            Some(entry) => {
                *entry = Some(upstream);
                true
            }
            None => false,
        }
    }

    /// The upstream at `index`, if connected.
    pub fn get(&self, index: usize) -> Option<NodeHandle> {
        self.slots.lock().unwrap().get(index).cloned().flatten()
    }
}

impl std::fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock().unwrap();
        let connected = slots.iter().filter(|s| s.is_some()).count();
        f.debug_struct("SlotTable")
            .field("slots", &slots.len())
            .field("connected", &connected)
            .finish()
    }
}

/// A store: the terminal consumer side of the factory boundary.
pub trait Store: Send {
    /// The store's URI-like identifier.
    fn uri(&self) -> String;

    /// Consume one frame.
    fn push(&mut self, frame: Frame) -> Result<()>;

    /// Finish writing (flush trailers, close files).
    fn complete(&mut self) -> Result<()> {
        Ok(())
    }
}
