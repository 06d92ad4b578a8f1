//! JSON path and value manipulation for keyed response payloads.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;
use serde_json_bytes::Value;

/// A JSON object with ordered keys.
pub type Object = Map<ByteString, Value>;

/// One step into a response value: an object key or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// A list index.
    Index(usize),
    /// A response key in an object.
    Key(String),
}

/// A path into a response value, as found in error locations and
/// incremental patches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Vec::new())
    }

    pub fn from_slice<T: AsRef<str>>(s: &[T]) -> Self {
        Self(
            s.iter()
                .map(|x| x.as_ref())
                .map(|s| match s.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(s.to_string()),
                })
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, element: PathElement) {
        self.0.push(element)
    }

    pub fn pop(&mut self) -> Option<PathElement> {
        self.0.pop()
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.0.last()
    }

    /// The path without its last element. Empty paths are their own parent.
    pub fn parent(&self) -> Path {
        let mut path = self.clone();
        path.pop();
        path
    }

    pub fn join(&self, element: PathElement) -> Path {
        let mut path = self.clone();
        path.push(element);
        path
    }
}

impl From<&'_ str> for Path {
    fn from(s: &str) -> Self {
        Self(
            s.split('/')
                .filter(|key| !key.is_empty())
                .map(|key| match key.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(key.to_string()),
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in self.iter() {
            write!(f, "/")?;
            match element {
                PathElement::Index(index) => write!(f, "{index}")?,
                PathElement::Key(key) => write!(f, "{key}")?,
            }
        }
        Ok(())
    }
}

/// Extension trait for reading and mutating values through a [`Path`].
pub trait ValueExt {
    /// Borrow the value at `path`, if every step resolves.
    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value>;

    /// Mutably borrow the value at `path`, if every step resolves.
    fn get_path_mut<'a>(&'a mut self, path: &Path) -> Option<&'a mut Value>;

    /// Recursively merge `other` into `self`: object entries are merged
    /// key-wise, list entries index-wise, anything else is replaced.
    fn deep_merge(&mut self, other: Value);

    /// Structural equality that also requires object keys to appear in the
    /// same order on both sides.
    fn eq_and_ordered(&self, other: &Self) -> bool;
}

impl ValueExt for Value {
    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value> {
        let mut current = self;
        for element in path.iter() {
            current = match (current, element) {
                (Value::Object(object), PathElement::Key(key)) => object.get(key.as_str())?,
                (Value::Array(array), PathElement::Index(index)) => array.get(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn get_path_mut<'a>(&'a mut self, path: &Path) -> Option<&'a mut Value> {
        let mut current = self;
        for element in path.iter() {
            current = match (current, element) {
                (Value::Object(object), PathElement::Key(key)) => object.get_mut(key.as_str())?,
                (Value::Array(array), PathElement::Index(index)) => array.get_mut(*index)?,
                _ => return None,
            };
        }
        Some(current)
    }

    fn deep_merge(&mut self, other: Value) {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => {
                for (key, value) in b {
                    match a.get_mut(&key) {
                        Some(existing) => existing.deep_merge(value),
                        None => {
                            a.insert(key, value);
                        }
                    }
                }
            }
            (Value::Array(a), Value::Array(b)) => {
                for (target, value) in a.iter_mut().zip(b) {
                    target.deep_merge(value);
                }
            }
            (a, b) => {
                *a = b;
            }
        }
    }

    fn eq_and_ordered(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.eq_and_ordered(vb))
            }
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(va, vb)| va.eq_and_ordered(vb))
            }
            (a, b) => a == b,
        }
    }
}
