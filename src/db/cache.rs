//! In-process result caches owned by a [`Connection`](super::Connection).
//!
//! Both caches are unbounded and live exactly as long as their connection.
//! The query cache is flushed on every write, the table cache on every DDL.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::models::{QueryParam, Row, RowWindow};

/// Cache key for a read: SHA-256 (hex) of the normalised query text, the
/// JSON-serialised parameters and the row window.
pub fn query_cache_key(sql: &str, params: &[QueryParam], window: Option<RowWindow>) -> String {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let params = serde_json::to_string(params).unwrap_or_default();
    let window = window
        .map(|w| format!("{}:{}", w.start, w.end))
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    hasher.update(params.as_bytes());
    hasher.update([0u8]);
    hasher.update(window.as_bytes());
    hex::encode(hasher.finalize())
}

/// Result sets keyed by [`query_cache_key`].
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: HashMap<String, Vec<Row>>,
    hits: u64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached result, counting a hit when found.
    pub fn get(&mut self, key: &str) -> Option<Vec<Row>> {
        let rows = self.entries.get(key).cloned();
        if rows.is_some() {
            self.hits += 1;
        }
        rows
    }

    pub fn insert(&mut self, key: String, rows: Vec<Row>) {
        self.entries.insert(key, rows);
    }

    pub fn flush(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(entries = self.entries.len(), "Flushing query cache");
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of reads answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits
    }
}

/// Table names keyed by prefix filter.
#[derive(Debug, Default)]
pub struct TableCache {
    entries: HashMap<String, Vec<String>>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, prefix: &str) -> Option<&[String]> {
        self.entries.get(prefix).map(Vec::as_slice)
    }

    pub fn insert(&mut self, prefix: impl Into<String>, tables: Vec<String>) {
        self.entries.insert(prefix.into(), tables);
    }

    pub fn flush(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
