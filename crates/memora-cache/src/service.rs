//! The query cache orchestrator.
//!
//! Callers compose caching explicitly at the call site:
//! `service.prepare(request, executor).await.execute().await`. Preparing
//! scores the query and consults the backend; executing either returns the
//! cached value or runs the executor, timing it to decide whether the result
//! is stored.

use crate::analyzer::{ComplexityAnalyzer, ComplexityScore};
use crate::cache::cache_keys::model_tag;
use crate::cache::{CacheBackend, KeyGenerator, SetOptions};
use crate::invalidation::{InvalidationManager, InvalidationReport};
use crate::metadata::{CacheEntryMetadata, MetadataStore};
use crate::metrics::{BackendMetrics, QueryMetrics};
use crate::query::{QueryOptions, QueryRequest, WriteOperation};
use crate::stats::{RunningStatistics, StatisticsAggregator};
use chrono::Utc;
use futures::future::join_all;
use memora_config::CacheConfig;
use memora_core::{BoxFuture, MemoraResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of executing a prepared query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome<T> {
    pub value: T,
    pub from_cache: bool,
    /// Whether this execution wrote the result to the cache.
    pub populated: bool,
    /// Executor latency on a miss, lookup latency on a hit, zero when the
    /// cache was bypassed.
    pub execution_time: Duration,
}

enum Plan<T> {
    /// Cache disabled or query not cacheable.
    Passthrough,
    Cached {
        key: String,
        value: T,
        lookup_time: Duration,
    },
    Populate { key: String, score: ComplexityScore },
}

/// A query whose cache decision has been made but whose executor has not run.
///
/// Dropping it without calling [`execute`](Self::execute) holds no resources.
#[must_use = "a prepared query does nothing until executed"]
pub struct PreparedQuery<'a, T, F> {
    service: &'a QueryCacheService,
    request: QueryRequest,
    plan: Plan<T>,
    executor: F,
}

impl<'a, T, F, Fut> PreparedQuery<'a, T, F>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = MemoraResult<T>> + Send,
{
    /// True when execution will return a cached value.
    #[must_use]
    pub fn from_cache(&self) -> bool {
        matches!(self.plan, Plan::Cached { .. })
    }

    /// The cache key, if the query was considered for caching.
    #[must_use]
    pub fn cache_key(&self) -> Option<String> {
        match &self.plan {
            Plan::Passthrough => None,
            Plan::Cached { key, .. } | Plan::Populate { key, .. } => Some(key.clone()),
        }
    }

    /// Runs the query.
    ///
    /// Executor errors propagate unchanged and nothing is cached. Cache write
    /// failures are logged; the computed result is still returned.
    pub async fn execute(self) -> MemoraResult<QueryOutcome<T>> {
        let Self {
            service,
            request,
            plan,
            executor,
        } = self;

        match plan {
            Plan::Passthrough => {
                let value = executor().await?;
                Ok(QueryOutcome {
                    value,
                    from_cache: false,
                    populated: false,
                    execution_time: Duration::ZERO,
                })
            }
            Plan::Cached {
                value,
                lookup_time,
                ..
            } => Ok(QueryOutcome {
                value,
                from_cache: true,
                populated: false,
                execution_time: lookup_time,
            }),
            Plan::Populate { key, score } => {
                let started = Instant::now();
                let value = match executor().await {
                    Ok(value) => value,
                    Err(e) => {
                        service.stats.record_failure(&request.entity_kind);
                        QueryMetrics::execution_failed(&request.entity_kind);
                        debug!(entity = %request.entity_kind, key = %key, error = %e, "Query executor failed");
                        return Err(e);
                    }
                };
                let execution_time = started.elapsed();

                let populated = if execution_time >= service.min_execution_time {
                    service
                        .populate(&request, &key, &score, &value, execution_time)
                        .await
                } else {
                    debug!(
                        entity = %request.entity_kind,
                        key = %key,
                        elapsed_ms = execution_time.as_millis() as u64,
                        "Query below population threshold"
                    );
                    false
                };

                service
                    .stats
                    .record_execution(&request.entity_kind, execution_time, populated);
                QueryMetrics::executed(&request.entity_kind, execution_time, populated);

                Ok(QueryOutcome {
                    value,
                    from_cache: false,
                    populated,
                    execution_time,
                })
            }
        }
    }
}

/// Populations between opportunistic expiry sweeps.
const PURGE_EVERY_POPULATIONS: u64 = 64;

/// Boxed executor used by [`WarmupQuery`].
pub type WarmupExecutor = Box<dyn FnOnce() -> BoxFuture<'static, Value> + Send>;

/// A query to pre-populate.
pub struct WarmupQuery {
    pub request: QueryRequest,
    pub executor: WarmupExecutor,
}

impl WarmupQuery {
    /// Creates a warmup descriptor from a request and an async executor.
    pub fn new<F, Fut>(request: QueryRequest, executor: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = MemoraResult<Value>> + Send + 'static,
    {
        Self {
            request,
            executor: Box::new(move || -> BoxFuture<'static, Value> { Box::pin(executor()) }),
        }
    }
}

/// Summary of a warmup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmReport {
    pub attempted: usize,
    pub populated: usize,
    pub already_cached: usize,
    /// Executed without being stored.
    pub skipped: usize,
    pub failed: usize,
}

/// Transparent query-result cache.
///
/// Explicitly constructed and shared by `Arc`; every instance owns its own
/// metadata, dependency map and statistics.
pub struct QueryCacheService {
    instance_id: String,
    backend: Arc<dyn CacheBackend>,
    analyzer: ComplexityAnalyzer,
    keys: KeyGenerator,
    default_ttl: Duration,
    min_execution_time: Duration,
    top_entries: usize,
    enabled: AtomicBool,
    populations: AtomicU64,
    metadata: Arc<MetadataStore>,
    stats: Arc<StatisticsAggregator>,
    invalidation: InvalidationManager,
}

impl QueryCacheService {
    /// Creates a service over `backend` with the given policy.
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        let keys = KeyGenerator::new(config.namespace.clone());
        let metadata = Arc::new(MetadataStore::new());
        let stats = Arc::new(StatisticsAggregator::new());
        let invalidation =
            InvalidationManager::new(backend.clone(), keys.clone(), metadata.clone(), stats.clone());
        let instance_id = format!("query-cache-{}", Uuid::new_v4());

        info!(
            instance_id = %instance_id,
            backend = backend.name(),
            namespace = %config.namespace,
            enabled = config.enabled,
            default_ttl_secs = config.default_ttl_secs,
            min_execution_time_ms = config.min_execution_time_ms,
            "Query cache initialized"
        );

        Self {
            instance_id,
            backend,
            analyzer: ComplexityAnalyzer::from_config(config),
            keys,
            default_ttl: config.default_ttl(),
            min_execution_time: config.min_execution_time(),
            top_entries: config.top_entries,
            enabled: AtomicBool::new(config.enabled),
            populations: AtomicU64::new(0),
            metadata,
            stats,
            invalidation,
        }
    }

    /// Instance identifier used in logs and metric labels.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Runtime switch. Disabling bypasses scoring, lookups and statistics.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(instance_id = %self.instance_id, enabled, "Query cache switched");
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// The complexity analyzer in use.
    #[must_use]
    pub fn analyzer(&self) -> &ComplexityAnalyzer {
        &self.analyzer
    }

    /// The key generator in use.
    #[must_use]
    pub fn keys(&self) -> &KeyGenerator {
        &self.keys
    }

    /// Decides how `request` will be served.
    pub async fn prepare<T, F, Fut>(&self, request: QueryRequest, executor: F) -> PreparedQuery<'_, T, F>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = MemoraResult<T>> + Send,
    {
        let plan = self.plan(&request).await;
        PreparedQuery {
            service: self,
            request,
            plan,
            executor,
        }
    }

    async fn plan<T: DeserializeOwned>(&self, request: &QueryRequest) -> Plan<T> {
        if !self.is_enabled() {
            return Plan::Passthrough;
        }

        let entity = request.entity_kind.as_str();
        let score = self.analyzer.score(&request.shape);
        if !score.cacheable {
            self.stats.record_uncacheable(entity);
            QueryMetrics::uncacheable(entity);
            debug!(entity = %entity, score = score.score, "Query not cacheable");
            return Plan::Passthrough;
        }

        let key = self.keys.generate(entity, &request.shape);
        let started = Instant::now();
        let lookup = self.backend.get_raw(&key).await;
        let lookup_time = started.elapsed();

        match lookup {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    let saved = self
                        .metadata
                        .touch(&key)
                        .and_then(|meta| Duration::try_from_secs_f64(meta.execution_time_ms / 1000.0).ok())
                        .map(|original| original.saturating_sub(lookup_time))
                        .unwrap_or_default();
                    self.stats.record_hit(entity, lookup_time, saved);
                    QueryMetrics::hit(entity, lookup_time);
                    debug!(entity = %entity, key = %key, "Cache hit");
                    return Plan::Cached {
                        key,
                        value,
                        lookup_time,
                    };
                }
                Err(e) => {
                    warn!(entity = %entity, key = %key, error = %e, "Discarding undecodable cached value");
                    self.stats.record_backend_error("decode");
                    BackendMetrics::backend_error("decode");
                    self.drop_lingering(&key);
                }
            },
            Ok(None) => self.drop_lingering(&key),
            Err(e) => {
                warn!(
                    entity = %entity,
                    key = %key,
                    backend = self.backend.name(),
                    error = %e,
                    "Cache lookup failed, executing directly"
                );
                self.stats.record_backend_error("get");
                BackendMetrics::backend_error("get");
            }
        }

        QueryMetrics::miss(entity, lookup_time);
        debug!(entity = %entity, key = %key, score = score.score, "Cache miss");
        Plan::Populate { key, score }
    }

    /// Metadata for a key the backend no longer holds.
    fn drop_lingering(&self, key: &str) {
        if self.metadata.remove(key).is_some() {
            self.invalidation.forget_key(key);
            debug!(key = %key, "Dropped metadata for expired entry");
        }
    }

    async fn populate<T: Serialize>(
        &self,
        request: &QueryRequest,
        key: &str,
        score: &ComplexityScore,
        value: &T,
        execution_time: Duration,
    ) -> bool {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Result not serializable, skipping cache population");
                self.stats.record_backend_error("encode");
                BackendMetrics::backend_error("encode");
                return false;
            }
        };

        let dependencies = request.dependency_kinds();
        let tags: Vec<String> = dependencies.iter().map(|kind| model_tag(kind)).collect();
        let ttl = request.ttl_override.unwrap_or(self.default_ttl);
        let options = SetOptions {
            ttl: Some(ttl),
            tags: tags.clone(),
        };

        if let Err(e) = self.backend.set_raw(key, &payload, &options).await {
            warn!(
                key = %key,
                backend = self.backend.name(),
                error = %e,
                "Cache population failed"
            );
            self.stats.record_backend_error("set");
            BackendMetrics::backend_error("set");
            return false;
        }

        let now = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl));
        self.metadata.insert(CacheEntryMetadata {
            key: key.to_string(),
            source_query: serde_json::to_string(&request.shape).unwrap_or_default(),
            entity_kind: request.entity_kind.clone(),
            complexity: score.score,
            execution_time_ms: execution_time.as_secs_f64() * 1000.0,
            result_size_bytes: payload.len(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            expires_at,
            tags,
            dependencies: dependencies.clone(),
        });
        self.invalidation.register_dependencies(key, &dependencies);

        debug!(
            entity = %request.entity_kind,
            key = %key,
            ttl_secs = ttl.as_secs(),
            bytes = payload.len(),
            "Populated cache entry"
        );

        if (self.populations.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_EVERY_POPULATIONS == 0 {
            self.purge_expired().await;
        }
        true
    }

    /// Drops expired entries from the backend, the metadata map and the
    /// dependency map. Returns the number of metadata entries removed.
    ///
    /// Runs every few populations and on each reporter tick.
    pub async fn purge_expired(&self) -> usize {
        match self.backend.purge_expired().await {
            Ok(purged) if purged > 0 => {
                debug!(backend = self.backend.name(), purged, "Backend purged expired entries");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Backend expiry purge failed");
                self.stats.record_backend_error("purge");
                BackendMetrics::backend_error("purge");
            }
        }

        let removed = self.metadata.remove_expired(Utc::now());
        self.invalidation.forget_keys(&removed);
        if !removed.is_empty() {
            debug!(instance_id = %self.instance_id, removed = removed.len(), "Dropped expired metadata");
        }
        removed.len()
    }

    /// `prepare` followed by `execute`.
    pub async fn run<T, F, Fut>(&self, request: QueryRequest, executor: F) -> MemoraResult<QueryOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = MemoraResult<T>> + Send,
    {
        self.prepare(request, executor).await.execute().await
    }

    /// Cached multi-document read.
    pub async fn fetch_many<T, F, Fut>(
        &self,
        entity_kind: &str,
        filter: Value,
        options: QueryOptions,
        executor: F,
    ) -> MemoraResult<QueryOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = MemoraResult<T>> + Send,
    {
        let request = QueryRequest::fetch_many(entity_kind, filter).with_options(options);
        self.run(request, executor).await
    }

    /// Cached single-document read.
    pub async fn fetch_one<T, F, Fut>(
        &self,
        entity_kind: &str,
        filter: Value,
        options: QueryOptions,
        executor: F,
    ) -> MemoraResult<QueryOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = MemoraResult<T>> + Send,
    {
        let request = QueryRequest::fetch_one(entity_kind, filter).with_options(options);
        self.run(request, executor).await
    }

    /// Cached document count.
    pub async fn count<F, Fut>(
        &self,
        entity_kind: &str,
        filter: Value,
        options: QueryOptions,
        executor: F,
    ) -> MemoraResult<QueryOutcome<u64>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = MemoraResult<u64>> + Send,
    {
        let request = QueryRequest::count(entity_kind, filter).with_options(options);
        self.run(request, executor).await
    }

    /// Cached aggregation pipeline.
    pub async fn aggregate<T, F, Fut>(
        &self,
        entity_kind: &str,
        pipeline: Value,
        options: QueryOptions,
        executor: F,
    ) -> MemoraResult<QueryOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = MemoraResult<T>> + Send,
    {
        let request = QueryRequest::aggregate(entity_kind, pipeline).with_options(options);
        self.run(request, executor).await
    }

    /// Manual invalidation by glob pattern and/or tags. Returns the number of
    /// keys the backend removed.
    pub async fn invalidate(&self, pattern: Option<&str>, tags: &[String]) -> u64 {
        self.invalidation
            .invalidate_matching(pattern, tags)
            .await
            .keys_deleted
    }

    /// Write-path hook: call after every create, update or delete.
    ///
    /// Never fails; backend problems are logged and counted.
    pub async fn invalidate_model(
        &self,
        entity_kind: &str,
        operation: WriteOperation,
        document_id: Option<&str>,
        fields: &[String],
    ) -> InvalidationReport {
        let mut report = self
            .invalidation
            .invalidate_by_entity(entity_kind, operation, document_id)
            .await;

        if !fields.is_empty() {
            let by_fields = self.invalidation.invalidate_by_fields(entity_kind, fields).await;
            report.patterns_issued += by_fields.patterns_issued;
            report.keys_deleted += by_fields.keys_deleted;
            report.failures += by_fields.failures;
        }
        report
    }

    /// Pre-populates the cache. Descriptors run concurrently and fail
    /// independently.
    pub async fn warm(&self, queries: Vec<WarmupQuery>) -> WarmReport {
        let attempted = queries.len();
        let runs = queries.into_iter().map(|query| {
            let entity = query.request.entity_kind.clone();
            async move {
                let outcome = self.run::<Value, _, _>(query.request, query.executor).await;
                (entity, outcome)
            }
        });

        let mut report = WarmReport {
            attempted,
            ..WarmReport::default()
        };
        for (entity, outcome) in join_all(runs).await {
            match outcome {
                Ok(outcome) if outcome.from_cache => report.already_cached += 1,
                Ok(outcome) if outcome.populated => report.populated += 1,
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    warn!(entity = %entity, error = %e, "Warmup query failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            instance_id = %self.instance_id,
            attempted = report.attempted,
            populated = report.populated,
            already_cached = report.already_cached,
            skipped = report.skipped,
            failed = report.failed,
            "Cache warmup finished"
        );
        report
    }

    /// Point-in-time statistics.
    #[must_use]
    pub fn get_statistics(&self) -> RunningStatistics {
        self.stats.snapshot(&self.metadata, self.top_entries)
    }

    /// Metadata for every tracked entry.
    #[must_use]
    pub fn get_query_metadata(&self) -> Vec<CacheEntryMetadata> {
        self.metadata.snapshot()
    }

    /// Metadata count, for gauges.
    #[must_use]
    pub fn tracked_entries(&self) -> usize {
        self.metadata.len()
    }

    /// The dependency tracker.
    #[must_use]
    pub fn invalidation_manager(&self) -> &InvalidationManager {
        &self.invalidation
    }
}
