//! String-keyed, typed property bags.
//!
//! Every node carries a [`PropertyBag`]; the stack interpreter talks to
//! nodes exclusively through this capability. Assignments arrive as text
//! and are validated against the declared type of the target property.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// A string value (quoted or unquoted).
    String(String),
    /// An integer value.
    Int(i64),
    /// A floating-point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
}

impl PropertyValue {
    /// Get as a string, converting if necessary.
    pub fn as_string(&self) -> String {
        match self {
            PropertyValue::String(s) => s.clone(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::Bool(b) => b.to_string(),
        }
    }

    /// Try to get as an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Int(i) => Some(*i as f64),
            PropertyValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            PropertyValue::String(s) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            PropertyValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    /// Parse text into a value of the same type as `self`.
    fn parse_as(&self, text: &str) -> Option<PropertyValue> {
        match self {
            PropertyValue::String(_) => Some(PropertyValue::String(text.to_string())),
            PropertyValue::Int(_) => text.parse().ok().map(PropertyValue::Int),
            PropertyValue::Float(_) => text.parse().ok().map(PropertyValue::Float),
            PropertyValue::Bool(_) => {
                PropertyValue::String(text.to_string()).as_bool().map(PropertyValue::Bool)
            }
        }
    }
}

/// A shared, validating property bag.
///
/// Cloning a `PropertyBag` yields another handle on the same storage; use
/// [`PropertyBag::deep_clone`] for an independent copy (frame shallow
/// copies and graph cloning both need one).
#[derive(Debug, Clone, Default)]
pub struct PropertyBag {
    inner: Arc<Mutex<HashMap<String, PropertyValue>>>,
}

impl PropertyBag {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a property, replacing any previous declaration.
    pub fn append(&self, name: impl Into<String>, value: PropertyValue) {
        self.inner.lock().unwrap().insert(name.into(), value);
    }

    /// Check whether a property is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().contains_key(name)
    }

    /// Get a property value.
    pub fn get(&self, name: &str) -> Option<PropertyValue> {
        self.inner.lock().unwrap().get(name).cloned()
    }

    /// Get a property as an integer (None if absent or not coercible).
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|v| v.as_i64())
    }

    /// Replace a property value, keeping whatever type the caller chose.
    pub fn set(&self, name: &str, value: PropertyValue) {
        self.inner.lock().unwrap().insert(name.to_string(), value);
    }

    /// Assign from text, validating against the declared type.
    ///
    /// An unknown `name` is an error unless it begins with `@`, which
    /// appends a new dynamic string property. A value that does not parse
    /// as the declared type is rejected without modifying the bag.
    pub fn assign(&self, name: &str, text: &str) -> Result<()> {
        let mut map = self.inner.lock().unwrap();
        match map.get(name) {
            Some(current) => match current.parse_as(text) {
                Some(value) => {
                    map.insert(name.to_string(), value);
                    Ok(())
                }
                None => Err(Error::InvalidProperty {
                    name: name.to_string(),
                    reason: format!("cannot parse {text:?} as the property's type"),
                }),
            },
            None if name.starts_with('@') => {
                map.insert(name.to_string(), PropertyValue::String(text.to_string()));
                Ok(())
            }
            None => Err(Error::InvalidProperty {
                name: name.to_string(),
                reason: "no such property".to_string(),
            }),
        }
    }

    /// List the declared property names.
    pub fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    /// Copy every value from `other` into this bag.
    ///
    /// Used when cloning a graph: the freshly constructed node already
    /// declares its properties, so values transfer typed.
    pub fn copy_from(&self, other: &PropertyBag) {
        let source = other.inner.lock().unwrap().clone();
        let mut map = self.inner.lock().unwrap();
        for (name, value) in source {
            map.insert(name, value);
        }
    }

    /// Produce an independent copy of the bag.
    pub fn deep_clone(&self) -> PropertyBag {
        PropertyBag {
            inner: Arc::new(Mutex::new(self.inner.lock().unwrap().clone())),
        }
    }
}
