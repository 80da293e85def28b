//! Redis-based cache backend.

use super::pattern::escape;
use super::{CacheBackend, InvalidationRequest, SetOptions};
use async_trait::async_trait;
use deadpool_redis::Pool;
use memora_core::{MemoraError, MemoraResult};
use redis::AsyncCommands;
use shaku::Component;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Default prefix for the Redis sets backing the tag index.
pub const DEFAULT_TAG_PREFIX: &str = "memora:tag:";

/// Keys requested per `SCAN` round trip.
const SCAN_BATCH: usize = 500;

/// Keys per `DEL` command during bulk invalidation.
const DELETE_CHUNK: usize = 500;

/// Redis-based cache backend.
///
/// Each tag is a Redis set `{tag_prefix}{tag}` holding the keys written with
/// it. The set's expiry is refreshed on every write so it lives as long as
/// its most recent member.
#[derive(Component)]
#[shaku(interface = CacheBackend)]
pub struct RedisCacheBackend {
    /// Redis connection pool. `None` disables the backend.
    pool: Option<Arc<Pool>>,
    /// Prefix for tag sets.
    #[shaku(default = DEFAULT_TAG_PREFIX.to_string())]
    tag_prefix: String,
}

impl RedisCacheBackend {
    /// Create a backend over a connection pool.
    #[must_use]
    pub fn new(pool: Arc<Pool>) -> Self {
        Self::with_tag_prefix(pool, DEFAULT_TAG_PREFIX)
    }

    /// Create a backend with a custom tag-set prefix.
    #[must_use]
    pub fn with_tag_prefix(pool: Arc<Pool>, tag_prefix: impl Into<String>) -> Self {
        Self {
            pool: Some(pool),
            tag_prefix: tag_prefix.into(),
        }
    }

    /// Create a no-op backend (for when Redis is disabled).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            pool: None,
            tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
        }
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}{}", self.tag_prefix, tag)
    }

    /// Get a connection from the pool.
    async fn get_conn(&self) -> MemoraResult<deadpool_redis::Connection> {
        match &self.pool {
            Some(pool) => pool.get().await.map_err(|e| {
                MemoraError::Cache(format!("Failed to get Redis connection: {}", e))
            }),
            None => Err(MemoraError::Cache("Cache is disabled".to_string())),
        }
    }

    /// `SET` plus tag-set maintenance as one transaction.
    ///
    /// A tag set never expires before its longest-lived member: `NX` gives a
    /// fresh set its first expiry, `GT` only ever extends it, and a member
    /// without TTL makes the set persistent.
    fn write_pipeline(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
        tags: &[String],
    ) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        pipe.atomic();
        match ttl_secs {
            Some(secs) => pipe.cmd("SET").arg(key).arg(value).arg("EX").arg(secs).ignore(),
            None => pipe.cmd("SET").arg(key).arg(value).ignore(),
        };
        for tag in tags {
            let tag_key = self.tag_key(tag);
            pipe.cmd("SADD").arg(&tag_key).arg(key).ignore();
            match ttl_secs {
                Some(secs) => {
                    pipe.cmd("EXPIRE").arg(&tag_key).arg(secs).arg("NX").ignore();
                    pipe.cmd("EXPIRE").arg(&tag_key).arg(secs).arg("GT").ignore();
                }
                None => {
                    pipe.cmd("PERSIST").arg(&tag_key).ignore();
                }
            }
        }
        pipe
    }

    /// Collects every key matching `pattern` with incremental `SCAN`.
    async fn scan_matching(
        conn: &mut deadpool_redis::Connection,
        pattern: &str,
        into: &mut HashSet<String>,
    ) -> MemoraResult<()> {
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await
                .map_err(|e| {
                    MemoraError::Cache(format!("Failed to scan keys matching '{}': {}", pattern, e))
                })?;
            into.extend(batch);
            if next == 0 {
                return Ok(());
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get_raw(&self, key: &str) -> MemoraResult<Option<String>> {
        if !self.is_enabled() {
            return Ok(None);
        }

        let mut conn = self.get_conn().await?;
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| MemoraError::Cache(format!("Failed to get key '{}': {}", key, e)))?;

        match &value {
            Some(_) => debug!(key = %key, "Redis hit"),
            None => debug!(key = %key, "Redis miss"),
        }

        Ok(value)
    }

    async fn set_raw(&self, key: &str, value: &str, options: &SetOptions) -> MemoraResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let mut conn = self.get_conn().await?;
        let ttl_secs = options.ttl.map(|ttl| ttl.as_secs().max(1));
        let pipe = self.write_pipeline(key, value, ttl_secs, &options.tags);

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| MemoraError::Cache(format!("Failed to set key '{}': {}", key, e)))?;

        debug!(key = %key, ttl_secs = ?ttl_secs, tags = ?options.tags, "Stored key");
        Ok(())
    }

    async fn delete(&self, key: &str) -> MemoraResult<bool> {
        if !self.is_enabled() {
            return Ok(false);
        }

        let mut conn = self.get_conn().await?;
        let deleted: i64 = conn
            .del(key)
            .await
            .map_err(|e| MemoraError::Cache(format!("Failed to delete key '{}': {}", key, e)))?;

        debug!(key = %key, deleted = deleted > 0, "Deleted key");
        Ok(deleted > 0)
    }

    async fn invalidate(&self, request: &InvalidationRequest) -> MemoraResult<u64> {
        if !self.is_enabled() || request.is_empty() {
            return Ok(0);
        }

        let mut conn = self.get_conn().await?;
        let mut keys = HashSet::new();

        if let Some(prefix) = &request.prefix {
            Self::scan_matching(&mut conn, &format!("{}*", escape(prefix)), &mut keys).await?;
        }
        if let Some(pattern) = &request.pattern {
            Self::scan_matching(&mut conn, pattern, &mut keys).await?;
        }

        let tag_keys: Vec<String> = request.tags.iter().map(|tag| self.tag_key(tag)).collect();
        for tag_key in &tag_keys {
            let members: Vec<String> = conn.smembers(tag_key).await.map_err(|e| {
                MemoraError::Cache(format!("Failed to read tag set '{}': {}", tag_key, e))
            })?;
            keys.extend(members);
        }

        let keys: Vec<String> = keys.into_iter().collect();
        let mut deleted: u64 = 0;
        for chunk in keys.chunks(DELETE_CHUNK) {
            let count: i64 = conn
                .del(chunk)
                .await
                .map_err(|e| MemoraError::Cache(format!("Failed to delete keys: {}", e)))?;
            deleted += count.max(0) as u64;
        }

        if !tag_keys.is_empty() {
            let _: i64 = conn
                .del(&tag_keys)
                .await
                .map_err(|e| MemoraError::Cache(format!("Failed to delete tag sets: {}", e)))?;
        }

        debug!(deleted = deleted, request = ?request, "Invalidated Redis keys");
        Ok(deleted)
    }
}
