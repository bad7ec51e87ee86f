//! Message parameter trees: dotted-key reconstitution and flattening.
//!
//! On the wire, parameters are a flat list of `key=value` tokens. Keys
//! containing `.` describe nested structure: `a.b.c=v` reconstitutes to
//! `{a: {b: {c: v}}}`, and flattening is the exact inverse. The tokens
//! `true`/`false` ingest as booleans and emit as those literals.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single parameter value: text, boolean, or a nested map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Plain text value.
    Text(String),
    /// Boolean, emitted as the literal `true`/`false`.
    Bool(bool),
    /// Nested parameter map, flattened to dotted keys on the wire.
    Map(Params),
}

impl ParamValue {
    /// Text content, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Nested map, if this is a map.
    pub fn as_map(&self) -> Option<&Params> {
        match self {
            ParamValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Wire representation of a leaf value; `None` for maps.
    pub(crate) fn wire_value(&self) -> Option<String> {
        match self {
            ParamValue::Text(s) => Some(s.clone()),
            ParamValue::Bool(b) => Some(b.to_string()),
            ParamValue::Map(_) => None,
        }
    }

    fn ingest(raw: &str) -> Self {
        match raw {
            "true" => ParamValue::Bool(true),
            "false" => ParamValue::Bool(false),
            _ => ParamValue::Text(raw.to_string()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<u64> for ParamValue {
    fn from(n: u64) -> Self {
        ParamValue::Text(n.to_string())
    }
}

impl From<Params> for ParamValue {
    fn from(m: Params) -> Self {
        ParamValue::Map(m)
    }
}

/// A message parameter map.
///
/// Keys beginning with `_` are internal and are never serialized to the
/// wire. Empty text values are skipped on output unless the connection is
/// configured to emit them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    entries: BTreeMap<String, ParamValue>,
}

impl Params {
    /// Create an empty parameter map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries at this level.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if this level holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a value; a dotted name traverses nested maps.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        match name.split_once('.') {
            None => self.entries.get(name),
            Some((head, rest)) => match self.entries.get(head) {
                Some(ParamValue::Map(m)) => m.get(rest),
                _ => None,
            },
        }
    }

    /// Text value of a (possibly dotted) key.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParamValue::as_str)
    }

    /// Boolean value of a (possibly dotted) key.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ParamValue::as_bool)
    }

    /// Leaf value as it would appear on the wire (text or boolean literal).
    pub fn get_wire(&self, name: &str) -> Option<String> {
        self.get(name).and_then(ParamValue::wire_value)
    }

    /// Set a value; a dotted name creates nested maps as needed.
    ///
    /// An intermediate key holding a leaf is replaced by a map (latest
    /// write wins).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let name = name.into();
        match name.split_once('.') {
            None => {
                self.entries.insert(name, value.into());
            }
            Some((head, rest)) => {
                let slot = self
                    .entries
                    .entry(head.to_string())
                    .or_insert_with(|| ParamValue::Map(Params::new()));
                if !matches!(slot, ParamValue::Map(_)) {
                    *slot = ParamValue::Map(Params::new());
                }
                if let ParamValue::Map(m) = slot {
                    m.set(rest.to_string(), value);
                }
            }
        }
    }

    /// Set a value only if the key is absent.
    pub fn set_default(&mut self, name: &str, value: impl Into<ParamValue>) {
        if self.get(name).is_none() {
            self.set(name.to_string(), value);
        }
    }

    /// Remove a (possibly dotted) key, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        match name.split_once('.') {
            None => self.entries.remove(name),
            Some((head, rest)) => match self.entries.get_mut(head) {
                Some(ParamValue::Map(m)) => m.remove(rest),
                _ => None,
            },
        }
    }

    /// Iterate entries at this level in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Ingest one wire token's key and value, reconstituting dotted keys
    /// into nested maps and recognizing boolean literals.
    pub fn ingest(&mut self, key: &str, value: &str) {
        self.set(key.to_string(), ParamValue::ingest(value));
    }

    /// Build a map from unescaped wire pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut params = Params::new();
        for (k, v) in pairs {
            params.ingest(k, v);
        }
        params
    }

    /// Flatten to wire pairs with dotted keys, in key order.
    ///
    /// Keys beginning with `_` are skipped at every level. Empty text
    /// values are skipped unless `emit_empty` is set.
    pub fn flatten(&self, emit_empty: bool) -> Vec<(String, String)> {
        let mut out = Vec::new();
        self.flatten_into("", emit_empty, &mut out);
        out
    }

    fn flatten_into(&self, prefix: &str, emit_empty: bool, out: &mut Vec<(String, String)>) {
        for (key, value) in &self.entries {
            if key.starts_with('_') {
                continue;
            }
            let full = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            match value {
                ParamValue::Map(m) => m.flatten_into(&full, emit_empty, out),
                ParamValue::Text(s) if s.is_empty() && !emit_empty => {}
                leaf => {
                    if let Some(v) = leaf.wire_value() {
                        out.push((full, v));
                    }
                }
            }
        }
    }

    /// Copy entries whose key starts with `prefix`.
    ///
    /// With `skip` set, the prefix is removed from the copied keys
    /// (`rtp_addr` copied with prefix `rtp_`/skip becomes `addr`).
    pub fn copy_params(&self, prefix: &str, skip: bool) -> Params {
        let mut out = Params::new();
        for (key, value) in &self.entries {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let target = if skip { stripped } else { key.as_str() };
                if target.is_empty() {
                    continue;
                }
                out.entries.insert(target.to_string(), value.clone());
            }
        }
        out
    }

    /// Merge another map into this one; existing keys are overwritten.
    pub fn merge(&mut self, other: &Params) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a String, &'a ParamValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, ParamValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl FromIterator<(String, ParamValue)> for Params {
    fn from_iter<T: IntoIterator<Item = (String, ParamValue)>>(iter: T) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.set(k, v);
        }
        params
    }
}
