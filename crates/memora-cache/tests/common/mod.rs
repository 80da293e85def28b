//! Shared test doubles for query cache integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use memora_cache::{CacheBackend, InMemoryCacheBackend, InvalidationRequest, QueryCacheService, QueryRequest, SetOptions};
use memora_config::CacheConfig;
use memora_core::{MemoraError, MemoraResult};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory backend that counts calls and can be told to fail.
#[derive(Default)]
pub struct RecordingBackend {
    pub inner: InMemoryCacheBackend,
    pub gets: AtomicUsize,
    pub sets: AtomicUsize,
    pub deletes: AtomicUsize,
    pub invalidations: AtomicUsize,
    pub fail_get: AtomicBool,
    pub fail_set: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheBackend for RecordingBackend {
    async fn get_raw(&self, key: &str) -> MemoraResult<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(MemoraError::Timeout(format!("GET {} timed out", key)));
        }
        self.inner.get_raw(key).await
    }

    async fn set_raw(&self, key: &str, value: &str, options: &SetOptions) -> MemoraResult<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(MemoraError::cache("SET refused: out of memory"));
        }
        self.inner.set_raw(key, value, options).await
    }

    async fn delete(&self, key: &str) -> MemoraResult<bool> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(MemoraError::cache("DEL failed"));
        }
        self.inner.delete(key).await
    }

    async fn invalidate(&self, request: &InvalidationRequest) -> MemoraResult<u64> {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate(request).await
    }

    async fn purge_expired(&self) -> MemoraResult<u64> {
        CacheBackend::purge_expired(&self.inner).await
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Policy that stores every cacheable result regardless of latency.
pub fn eager_config() -> CacheConfig {
    CacheConfig {
        min_execution_time_ms: 0,
        ..CacheConfig::default()
    }
}

pub fn service_with(backend: Arc<RecordingBackend>, config: &CacheConfig) -> Arc<QueryCacheService> {
    Arc::new(QueryCacheService::new(backend, config))
}

/// Scenario B shape: pattern-match predicate sorted by creation date.
pub fn regex_request() -> QueryRequest {
    QueryRequest::fetch_many("Ticket", json!({"title": {"$regex": "abc"}})).with_options(
        memora_cache::QueryOptions::new().with_sort(json!({"createdAt": -1})),
    )
}

/// Resolves to `value` after `delay`.
pub async fn slow<T>(value: T, delay: Duration) -> MemoraResult<T> {
    tokio::time::sleep(delay).await;
    Ok(value)
}
