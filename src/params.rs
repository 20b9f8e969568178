//! `key=value;key=value` parameter strings.

use std::fmt;

/// An ordered list of key/value pairs.
///
/// Keys compare case-insensitively. A key given without `=` (as in a
/// `get_parameters` query) has an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvPairs {
    pairs: Vec<(String, String)>,
}

impl KvPairs {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `;`-separated parameter string.
    pub fn parse(input: &str) -> Self {
        let pairs = input
            .split(';')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| match item.split_once('=') {
                Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
                None => (item.to_string(), String::new()),
            })
            .collect();
        Self { pairs }
    }

    /// Returns the value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the value of `key` parsed as an unsigned integer.
    ///
    /// Accepts decimal and `0x`-prefixed hexadecimal.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        let value = self.get(key)?;
        match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => value.parse().ok(),
        }
    }

    /// Returns `true` if `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterates over the keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    /// Appends a pair.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Returns `true` if there are no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for KvPairs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}
