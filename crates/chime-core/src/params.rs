//! `key=value;key=value` parameter strings for the hardware layer
//!
//! Streams and devices are reconfigured with small textual parameter
//! lists. Wrappers that sit between the server and a real device (the
//! dump device, an A2DP relay) must forward keys they do not recognize
//! instead of dropping them, so the carrier type preserves entry order.

use std::fmt;

/// Well-known parameter keys
pub mod keys {
    pub const ROUTING: &str = "routing";
    pub const SAMPLING_RATE: &str = "sampling_rate";
    pub const FORMAT: &str = "format";
    pub const CHANNELS: &str = "channels";
    pub const FRAME_COUNT: &str = "frame_count";
}

/// An ordered list of `key=value` pairs
///
/// Insertion order is preserved; re-setting a key updates it in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterMap {
    pairs: Vec<(String, String)>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key=value;key=value` string. Empty segments are skipped;
    /// a segment without `=` parses as a key with an empty value (used by
    /// `get_parameters` key lists).
    pub fn parse(s: &str) -> Self {
        let mut map = Self::new();
        for segment in s.split(';') {
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((k, v)) => map.set(k, v),
                None => map.set(segment, ""),
            }
        }
        map
    }

    /// Set a key, replacing any existing value
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(pair) = self.pairs.iter_mut().find(|(k, _)| k == key) {
            pair.1 = value.to_string();
        } else {
            self.pairs.push((key.to_string(), value.to_string()));
        }
    }

    /// Set an integer value
    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, &value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Remove a key, returning its value if present
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.pairs.iter().position(|(k, _)| k == key)?;
        Some(self.pairs.remove(idx).1)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Append every pair of `other` into `self` (later values win)
    pub fn merge(&mut self, other: &ParameterMap) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }
}

impl fmt::Display for ParameterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            if v.is_empty() {
                write!(f, "{}", k)?;
            } else {
                write!(f, "{}={}", k, v)?;
            }
        }
        Ok(())
    }
}
