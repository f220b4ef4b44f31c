use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{AghError, Result};

/// A hierarchical key: one segment per nesting level.
///
/// Segments may themselves contain dots (file names are used as keys), so
/// the dotted form is only a convenience for callers at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn new<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(AghError::Validation("metadata key is empty".to_string()));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(AghError::Validation(format!(
                "metadata key {:?} has an empty segment",
                segments.join(".")
            )));
        }
        Ok(KeyPath(segments))
    }

    /// Splits on `.`; `"a..b"`, `".a"` and `""` are rejected.
    pub fn parse(dotted: &str) -> Result<Self> {
        Self::new(dotted.split('.'))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// A new key with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Result<Self> {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self::new(segments)
    }
}

impl FromStr for KeyPath {
    type Err = AghError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Free-form key/value store attached to assignments, submissions and
/// options. Values are arbitrary JSON trees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &KeyPath) -> Option<&Value> {
        let (first, rest) = key.0.split_first()?;
        let mut cur = self.0.get(first)?;
        for segment in rest {
            cur = cur.as_object()?.get(segment)?;
        }
        Some(cur)
    }

    pub fn get_or<'a>(&'a self, key: &KeyPath, default: &'a Value) -> &'a Value {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &KeyPath) -> bool {
        self.get(key).is_some()
    }

    /// Typed read; a stored value of the wrong shape is a `Validation` error.
    pub fn get_as<T: DeserializeOwned>(&self, key: &KeyPath) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| {
                AghError::Validation(format!("metadata value at {} has the wrong shape: {}", key, e))
            }),
        }
    }

    /// Stores `value`, creating intermediate maps as needed. Sibling keys at
    /// every level are preserved; a non-map intermediate is replaced.
    pub fn set(&mut self, key: &KeyPath, value: Value) {
        let (last, parents) = match key.0.split_last() {
            Some(split) => split,
            None => return,
        };
        let mut cur = &mut self.0;
        for (depth, segment) in parents.iter().enumerate() {
            let slot = cur
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                warn!(
                    key = %key,
                    at = %key.0[..=depth].join("."),
                    "replacing non-map metadata value with a map"
                );
                *slot = Value::Object(Map::new());
            }
            cur = match slot {
                Value::Object(map) => map,
                _ => return,
            };
        }
        cur.insert(last.clone(), value);
    }

    /// Removes and returns the value at `key`. Empty parent maps are left in
    /// place.
    pub fn remove(&mut self, key: &KeyPath) -> Option<Value> {
        let (last, parents) = key.0.split_last()?;
        let mut cur = &mut self.0;
        for segment in parents {
            cur = cur.get_mut(segment)?.as_object_mut()?;
        }
        cur.remove(last)
    }

    /// Child map at `key`, if present and a map.
    pub fn get_map(&self, key: &KeyPath) -> Option<&Map<String, Value>> {
        self.get(key).and_then(Value::as_object)
    }
}

impl From<Map<String, Value>> for Metadata {
    fn from(map: Map<String, Value>) -> Self {
        Metadata(map)
    }
}
