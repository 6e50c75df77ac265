//! Node factories: the only boundary where the core reaches into the
//! plugin ecosystem.
//!
//! The [`NodeFactory`] trait is injectable so tests (and embedders) can
//! supply their own plugin set; [`NodeRegistry`] is the default
//! implementation with the built-ins registered.

use crate::error::{Error, Result};
use crate::filters::{ClipFilter, DistributorFilter, LockFilter, TeeFilter};
use crate::frame::Frame;
use crate::inputs::{PacketInput, TestPatternInput};
use crate::node::{Node, NodeBase, NodeHandle, NodeKind, Store};
use crate::property::PropertyBag;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// The factory capability the stack interpreter and distributor depend on.
///
/// `create_input` and `create_filter` never fail eagerly: an unknown URI
/// yields a placeholder whose `init()` reports [`Error::UnresolvedToken`],
/// so failures surface at the first operation that forces resolution.
pub trait NodeFactory: Send + Sync {
    /// Create an input for a URI.
    fn create_input(&self, uri: &str) -> NodeHandle;

    /// Create a filter by bare name (no `filter:` prefix).
    fn create_filter(&self, name: &str) -> NodeHandle;

    /// Create a store for a URI, shaped by the first frame it will receive.
    fn create_store(&self, uri: &str, first: &Frame) -> Result<Box<dyn Store>>;
}

/// Constructor for a registered input scheme.
pub type InputConstructor = fn(&str) -> NodeHandle;

/// Constructor for a registered filter.
pub type FilterConstructor = fn(Arc<dyn NodeFactory>) -> NodeHandle;

/// Constructor for a registered store scheme.
pub type StoreConstructor = fn(&str, &Frame) -> Result<Box<dyn Store>>;

/// Registry of node constructors keyed by URI scheme / filter name.
pub struct NodeRegistry {
    inputs: Mutex<HashMap<String, InputConstructor>>,
    filters: Mutex<HashMap<String, FilterConstructor>>,
    stores: Mutex<HashMap<String, StoreConstructor>>,
    weak_self: Weak<NodeRegistry>,
}

impl NodeRegistry {
    /// Create a registry with the built-in nodes registered.
    pub fn standard() -> Arc<Self> {
        let registry = Self::empty();
        registry.register_input("test:", create_test_input);
        registry.register_input("packets:", create_packet_input);
        registry.register_filter("clip", create_clip);
        registry.register_filter("tee", create_tee);
        registry.register_filter("lock", create_lock);
        registry.register_filter("distributor", create_distributor);
        registry.register_store("null:", create_null_store);
        registry
    }

    /// Create a registry with nothing registered.
    pub fn empty() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inputs: Mutex::new(HashMap::new()),
            filters: Mutex::new(HashMap::new()),
            stores: Mutex::new(HashMap::new()),
            weak_self: weak.clone(),
        })
    }

    /// Register an input constructor for a URI scheme (e.g. `"test:"`).
    pub fn register_input(&self, scheme: &str, constructor: InputConstructor) {
        self.inputs.lock().unwrap().insert(scheme.to_string(), constructor);
    }

    /// Register a filter constructor by bare name.
    pub fn register_filter(&self, name: &str, constructor: FilterConstructor) {
        self.filters.lock().unwrap().insert(name.to_string(), constructor);
    }

    /// Register a store constructor for a URI scheme.
    pub fn register_store(&self, scheme: &str, constructor: StoreConstructor) {
        self.stores.lock().unwrap().insert(scheme.to_string(), constructor);
    }

    /// Check whether a filter name is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.filters.lock().unwrap().contains_key(name)
    }

    /// List the registered filter names.
    pub fn list_filters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.filters.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn as_factory(&self) -> Arc<dyn NodeFactory> {
        // The registry only hands itself out while the Arc is alive.
        self.weak_self.upgrade().expect("registry used after drop")
    }

    fn scheme_of(uri: &str) -> Option<&str> {
        uri.find(':').map(|pos| &uri[..=pos])
    }
}

impl NodeFactory for NodeRegistry {
    fn create_input(&self, uri: &str) -> NodeHandle {
        let constructor = Self::scheme_of(uri)
            .and_then(|scheme| self.inputs.lock().unwrap().get(scheme).copied());
        match constructor {
            Some(constructor) => constructor(uri),
            None => Arc::new(UnresolvedNode::new(uri)),
        }
    }

    fn create_filter(&self, name: &str) -> NodeHandle {
        let constructor = self.filters.lock().unwrap().get(name).copied();
        match constructor {
            Some(constructor) => constructor(self.as_factory()),
            None => Arc::new(UnresolvedNode::new(format!("filter:{name}"))),
        }
    }

    fn create_store(&self, uri: &str, first: &Frame) -> Result<Box<dyn Store>> {
        let constructor = Self::scheme_of(uri)
            .and_then(|scheme| self.stores.lock().unwrap().get(scheme).copied());
        match constructor {
            Some(constructor) => constructor(uri, first),
            None => Err(Error::UnresolvedToken(uri.to_string())),
        }
    }
}

// Built-in node constructors

fn create_test_input(uri: &str) -> NodeHandle {
    Arc::new(TestPatternInput::new(uri))
}

fn create_packet_input(uri: &str) -> NodeHandle {
    Arc::new(PacketInput::new(uri))
}

fn create_clip(_factory: Arc<dyn NodeFactory>) -> NodeHandle {
    Arc::new(ClipFilter::new())
}

fn create_tee(_factory: Arc<dyn NodeFactory>) -> NodeHandle {
    Arc::new(TeeFilter::new())
}

fn create_lock(_factory: Arc<dyn NodeFactory>) -> NodeHandle {
    Arc::new(LockFilter::new())
}

fn create_distributor(factory: Arc<dyn NodeFactory>) -> NodeHandle {
    Arc::new(DistributorFilter::new(factory))
}

fn create_null_store(uri: &str, _first: &Frame) -> Result<Box<dyn Store>> {
    Ok(Box::new(NullStore::new(uri)))
}

/// Placeholder for a token that looked like a factory request but matched
/// nothing. Sits on the stack until an operation forces resolution.
#[derive(Debug)]
struct UnresolvedNode {
    base: NodeBase,
    uri: String,
}

impl UnresolvedNode {
    fn new(uri: impl Into<String>) -> Self {
        Self {
            base: NodeBase::new(),
            uri: uri.into(),
        }
    }
}

impl Node for UnresolvedNode {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Input
    }

    fn init(&self) -> Result<()> {
        Err(Error::UnresolvedToken(self.uri.clone()))
    }

    fn frames(&self) -> i32 {
        0
    }

    fn seek(&self, position: i32, relative: bool) {
        self.base.seek(position, relative, 0);
    }

    fn position(&self) -> i32 {
        self.base.position()
    }

    fn fetch(&self) -> Result<Frame> {
        Err(Error::UnresolvedToken(self.uri.clone()))
    }

    fn properties(&self) -> PropertyBag {
        self.base.properties()
    }
}

/// A store that discards everything (the `null:` scheme).
#[derive(Debug)]
pub struct NullStore {
    uri: String,
    pushed: u64,
}

impl NullStore {
    /// Create a null store.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            pushed: 0,
        }
    }

    /// Number of frames discarded so far.
    pub fn pushed(&self) -> u64 {
        self.pushed
    }
}

impl Store for NullStore {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn push(&mut self, _frame: Frame) -> Result<()> {
        self.pushed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_scheme_resolves() {
        let registry = NodeRegistry::standard();
        let input = registry.create_input("test:");
        assert!(input.init().is_ok());
        assert_eq!(input.frames(), 250);
    }

    #[test]
    fn test_unknown_scheme_fails_lazily() {
        let registry = NodeRegistry::standard();
        let input = registry.create_input("nosuch:thing");
        assert!(matches!(input.init(), Err(Error::UnresolvedToken(_))));
    }

    #[test]
    fn test_unknown_filter_fails_lazily() {
        let registry = NodeRegistry::standard();
        let filter = registry.create_filter("nosuch");
        assert!(filter.init().is_err());
    }

    #[test]
    fn test_store_creation() {
        let registry = NodeRegistry::standard();
        let mut store = registry.create_store("null:", &Frame::new(0)).unwrap();
        store.push(Frame::new(0)).unwrap();
        assert!(registry.create_store("bad:", &Frame::new(0)).is_err());
    }

    #[test]
    fn test_filter_listing() {
        let registry = NodeRegistry::standard();
        assert!(registry.is_registered("distributor"));
        let names = registry.list_filters();
        assert!(names.contains(&"lock".to_string()));
        assert!(names.contains(&"clip".to_string()));
    }
}
