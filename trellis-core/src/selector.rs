//! Query parameters: `key=value` pairs separated by `;`.
//!
//! A key without `=` carries an empty value. Keys starting with `_` are
//! reserved for the engine (`_time` switches AUTO consolidation to NONE).

use std::fmt;

/// Parameter key that disables LATEST consolidation under AUTO.
pub const TIME_RANGE_KEY: &str = "_time";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters(String);

impl Parameters {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(key, value)` pairs in order, skipping empty segments.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .split(';')
            .filter(|seg| !seg.is_empty())
            .map(|seg| seg.split_once('=').unwrap_or((seg, "")))
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set `key` to `value`, replacing an existing entry.
    pub fn insert(&mut self, key: &str, value: &str) {
        let mut parts: Vec<String> = self
            .iter()
            .filter(|(k, _)| *k != key)
            .map(|(k, v)| if v.is_empty() { k.to_owned() } else { format!("{k}={v}") })
            .collect();
        parts.push(if value.is_empty() {
            key.to_owned()
        } else {
            format!("{key}={value}")
        });
        self.0 = parts.join(";");
    }

    pub fn has_time_range(&self) -> bool {
        self.contains_key(TIME_RANGE_KEY)
    }
}

impl From<&str> for Parameters {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Parameters {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
