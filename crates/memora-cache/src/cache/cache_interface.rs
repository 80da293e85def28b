//! Cache backend trait for abstracted caching operations.

use async_trait::async_trait;
use memora_core::MemoraResult;
use shaku::Interface;
use std::time::Duration;

/// Options for a single write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// Time to live. `None` stores without expiry.
    pub ttl: Option<Duration>,
    /// Tags the entry can later be invalidated by.
    pub tags: Vec<String>,
}

impl SetOptions {
    /// Options with a TTL and no tags.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    /// Adds tags.
    #[must_use]
    pub fn tagged(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }
}

/// Bulk invalidation selector. Every populated field is applied; an empty
/// request invalidates nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationRequest {
    /// Literal key prefix.
    pub prefix: Option<String>,
    /// Glob pattern (`*` and `?`).
    pub pattern: Option<String>,
    /// Tags whose members are removed.
    pub tags: Vec<String>,
}

impl InvalidationRequest {
    /// Invalidates keys starting with `prefix`.
    #[must_use]
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    /// Invalidates keys matching a glob pattern.
    #[must_use]
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Self::default()
        }
    }

    /// Invalidates every key carrying one of `tags`.
    #[must_use]
    pub fn tags(tags: impl IntoIterator<Item = String>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
            ..Self::default()
        }
    }

    /// True when no selector is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prefix.is_none() && self.pattern.is_none() && self.tags.is_empty()
    }
}

/// Key-value store holding cached query results.
///
/// Values are JSON strings so the trait stays dyn-compatible. Every call may
/// fail independently; callers in this crate log and continue.
#[async_trait]
pub trait CacheBackend: Interface + Send + Sync {
    /// Get a raw JSON value. `None` if absent or expired.
    async fn get_raw(&self, key: &str) -> MemoraResult<Option<String>>;

    /// Store a raw JSON value.
    async fn set_raw(&self, key: &str, value: &str, options: &SetOptions) -> MemoraResult<()>;

    /// Delete a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> MemoraResult<bool>;

    /// Delete every key selected by `request`. Returns the number deleted.
    async fn invalidate(&self, request: &InvalidationRequest) -> MemoraResult<u64>;

    /// Drops expired entries. Backends with native expiry do nothing.
    async fn purge_expired(&self) -> MemoraResult<u64> {
        Ok(0)
    }

    /// Whether the backend stores anything at all.
    fn is_enabled(&self) -> bool;

    /// Short backend name for logs and metric labels.
    fn name(&self) -> &'static str;
}

/// Typed JSON access on top of [`CacheBackend`].
#[async_trait]
pub trait CacheExt: CacheBackend {
    /// Get a typed value.
    async fn get<T: serde::de::DeserializeOwned + Send>(&self, key: &str) -> MemoraResult<Option<T>> {
        match self.get_raw(key).await? {
            Some(json) => {
                let value: T = serde_json::from_str(&json)?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a typed value.
    async fn set<T: serde::Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        options: &SetOptions,
    ) -> MemoraResult<()> {
        let json = serde_json::to_string(value)?;
        self.set_raw(key, &json, options).await
    }
}

impl<T: CacheBackend + ?Sized> CacheExt for T {}
