//! Bookkeeping for populated cache entries.
//!
//! The backend is the source of truth for values. This map is a secondary
//! index and may briefly refer to keys the backend has already expired.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::cache::pattern::glob_match;

/// Metadata recorded when a result is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMetadata {
    pub key: String,
    /// Canonical JSON of the query shape that produced the entry.
    pub source_query: String,
    pub entity_kind: String,
    pub complexity: f64,
    pub execution_time_ms: f64,
    pub result_size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// When the backend drops the entry. `None` means no expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    /// Entity kinds whose writes invalidate this entry.
    pub dependencies: Vec<String>,
}

/// Concurrent map of [`CacheEntryMetadata`] by cache key.
#[derive(Debug, Default)]
pub struct MetadataStore {
    entries: RwLock<HashMap<String, CacheEntryMetadata>>,
}

impl MetadataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the metadata for `metadata.key`.
    pub fn insert(&self, metadata: CacheEntryMetadata) {
        self.entries.write().insert(metadata.key.clone(), metadata);
    }

    /// Records a hit. Returns the updated metadata if the key is tracked.
    pub fn touch(&self, key: &str) -> Option<CacheEntryMetadata> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed_at = Utc::now();
        Some(entry.clone())
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntryMetadata> {
        self.entries.write().remove(key)
    }

    /// Removes entries whose key matches a glob pattern. Returns the removed keys.
    pub fn remove_matching(&self, pattern: &str) -> Vec<String> {
        self.remove_where(|key, _| glob_match(pattern, key))
    }

    /// Removes entries carrying any of `tags`. Returns the removed keys.
    pub fn remove_tagged(&self, tags: &[String]) -> Vec<String> {
        if tags.is_empty() {
            return Vec::new();
        }
        self.remove_where(|_, meta| meta.tags.iter().any(|tag| tags.contains(tag)))
    }

    /// Removes entries whose expiry is at or before `now`. Returns the
    /// removed keys.
    pub fn remove_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.remove_where(|_, meta| meta.expires_at.is_some_and(|at| at <= now))
    }

    fn remove_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&str, &CacheEntryMetadata) -> bool,
    {
        let mut entries = self.entries.write();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(key, meta)| predicate(key.as_str(), meta))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        doomed
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheEntryMetadata> {
        self.entries.read().get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every entry.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CacheEntryMetadata> {
        self.entries.read().values().cloned().collect()
    }

    /// The `n` most accessed entries, most recent access breaking ties.
    ///
    /// Sorted on demand; snapshots are rare compared to hits.
    #[must_use]
    pub fn top_accessed(&self, n: usize) -> Vec<CacheEntryMetadata> {
        let mut entries = self.snapshot();
        entries.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| b.last_accessed_at.cmp(&a.last_accessed_at))
                .then_with(|| a.key.cmp(&b.key))
        });
        entries.truncate(n);
        entries
    }
}
