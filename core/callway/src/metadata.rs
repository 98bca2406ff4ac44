// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Call metadata.
//!
//! Keys are ASCII case-insensitive and stored lower-cased. Each key maps to an
//! ordered set of values: appending a value already present is a no-op.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

fn normalize(key: &str) -> String {
    key.to_ascii_lowercase()
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every value stored under `key`, returning the previous ones.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) -> Option<Vec<String>> {
        self.entries.insert(normalize(key), vec![value.into()])
    }

    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        let values = self.entries.entry(normalize(key)).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&normalize(key))
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .get(&normalize(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.entries.remove(&normalize(key))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&normalize(key))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` into `self`. Keys present in both take the values of `other`.
    pub fn merge(&mut self, other: Metadata) {
        self.entries.extend(other.entries);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(key, values)| (key.as_str(), values.as_slice()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.append(key.as_ref(), value);
        }
        metadata
    }
}
