//! Process-local cache backend.

use super::pattern::glob_match;
use super::{CacheBackend, InvalidationRequest, SetOptions};
use async_trait::async_trait;
use memora_core::MemoraResult;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
    tags: Vec<String>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Writes between opportunistic purges.
const DEFAULT_PURGE_EVERY: u64 = 128;

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    tags: HashMap<String, HashSet<String>>,
    writes_since_purge: u64,
}

impl State {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.writes_since_purge = 0;
        expired.len()
    }

    fn remove(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(members) = self.tags.get_mut(tag) {
                members.remove(key);
                if members.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        Some(entry)
    }
}

/// In-memory cache backend with per-entry expiry and a tag index.
///
/// Expired entries are dropped on access and swept every `purge_every`
/// writes. [`Self::purge_expired`] sweeps on demand.
///
/// [`purge_expired`]: InMemoryCacheBackend::purge_expired
#[derive(Debug)]
pub struct InMemoryCacheBackend {
    state: RwLock<State>,
    purge_every: u64,
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::with_purge_every(DEFAULT_PURGE_EVERY)
    }
}

impl InMemoryCacheBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty backend that sweeps expired entries every
    /// `writes` writes.
    #[must_use]
    pub fn with_purge_every(writes: u64) -> Self {
        Self {
            state: RwLock::new(State::default()),
            purge_every: writes.max(1),
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// True when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        self.state.write().purge_expired(Instant::now())
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    fn is_enabled(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn purge_expired(&self) -> MemoraResult<u64> {
        Ok(InMemoryCacheBackend::purge_expired(self) as u64)
    }

    async fn get_raw(&self, key: &str) -> MemoraResult<Option<String>> {
        let now = Instant::now();
        {
            let state = self.state.read();
            match state.entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        self.state.write().remove(key);
        debug!(key = %key, "Dropped expired entry");
        Ok(None)
    }

    async fn set_raw(&self, key: &str, value: &str, options: &SetOptions) -> MemoraResult<()> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
            tags: options.tags.clone(),
        };

        let mut state = self.state.write();
        state.writes_since_purge += 1;
        if state.writes_since_purge >= self.purge_every {
            let purged = state.purge_expired(Instant::now());
            if purged > 0 {
                debug!(purged = purged, "Purged expired entries");
            }
        }
        state.remove(key);
        for tag in &entry.tags {
            state
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        state.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> MemoraResult<bool> {
        let now = Instant::now();
        let removed = self.state.write().remove(key);
        Ok(removed.is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn invalidate(&self, request: &InvalidationRequest) -> MemoraResult<u64> {
        if request.is_empty() {
            return Ok(0);
        }

        let now = Instant::now();
        let mut state = self.state.write();

        let mut selected: HashSet<String> = HashSet::new();
        for key in state.entries.keys() {
            let by_prefix = request
                .prefix
                .as_deref()
                .is_some_and(|prefix| key.starts_with(prefix));
            let by_pattern = request
                .pattern
                .as_deref()
                .is_some_and(|pattern| glob_match(pattern, key));
            if by_prefix || by_pattern {
                selected.insert(key.clone());
            }
        }
        for tag in &request.tags {
            if let Some(members) = state.tags.get(tag) {
                selected.extend(members.iter().cloned());
            }
        }

        let mut deleted = 0u64;
        for key in &selected {
            if let Some(entry) = state.remove(key) {
                if !entry.is_expired(now) {
                    deleted += 1;
                }
            }
        }

        debug!(deleted = deleted, request = ?request, "Invalidated in-memory entries");
        Ok(deleted)
    }
}
