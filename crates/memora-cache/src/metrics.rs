//! Metrics for query cache monitoring.
//!
//! Per-call counters and histograms are emitted inline. Aggregate gauges are
//! pushed periodically by [`StatisticsReporter`](crate::StatisticsReporter).

use crate::stats::RunningStatistics;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the query cache.
pub mod names {
    /// Queries answered from the cache.
    pub const HITS_TOTAL: &str = "memora_cache_hits_total";
    /// Cacheable queries that missed.
    pub const MISSES_TOTAL: &str = "memora_cache_misses_total";
    /// Queries rejected by the complexity gate.
    pub const UNCACHEABLE_TOTAL: &str = "memora_cache_uncacheable_total";
    /// Results written to the backend.
    pub const POPULATIONS_TOTAL: &str = "memora_cache_populations_total";
    /// Executor failures observed on the miss path.
    pub const EXECUTION_ERRORS_TOTAL: &str = "memora_cache_execution_errors_total";
    /// Invalidation calls.
    pub const INVALIDATIONS_TOTAL: &str = "memora_cache_invalidations_total";
    /// Keys removed by invalidation.
    pub const INVALIDATED_KEYS_TOTAL: &str = "memora_cache_invalidated_keys_total";
    /// Swallowed backend failures.
    pub const BACKEND_ERRORS_TOTAL: &str = "memora_cache_backend_errors_total";

    /// Executor latency in seconds.
    pub const EXECUTION_SECONDS: &str = "memora_cache_execution_seconds";
    /// Backend lookup latency in seconds.
    pub const LOOKUP_SECONDS: &str = "memora_cache_lookup_seconds";

    /// Running hit rate (0.0 to 1.0).
    pub const HIT_RATE: &str = "memora_cache_hit_rate";
    /// Queries seen since start.
    pub const QUERIES: &str = "memora_cache_queries";
    /// Queries served from cache since start.
    pub const CACHED_QUERIES: &str = "memora_cache_cached_queries";
    /// Running average execution time in milliseconds.
    pub const AVERAGE_EXECUTION_MS: &str = "memora_cache_average_execution_ms";
    /// Running average lookup time on hits in milliseconds.
    pub const AVERAGE_CACHE_MS: &str = "memora_cache_average_cache_ms";
    /// Estimated execution time saved by hits in milliseconds.
    pub const TIME_SAVED_MS: &str = "memora_cache_time_saved_ms";
    /// Entries with tracked metadata.
    pub const TRACKED_ENTRIES: &str = "memora_cache_tracked_entries";
    /// Per-entity hit rate.
    pub const ENTITY_HIT_RATE: &str = "memora_cache_entity_hit_rate";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::HITS_TOTAL, "Total number of queries answered from the cache");
    describe_counter!(names::MISSES_TOTAL, "Total number of cacheable queries that missed");
    describe_counter!(
        names::UNCACHEABLE_TOTAL,
        "Total number of queries rejected by the complexity gate"
    );
    describe_counter!(names::POPULATIONS_TOTAL, "Total number of results written to the cache");
    describe_counter!(
        names::EXECUTION_ERRORS_TOTAL,
        "Total number of query executor failures on the miss path"
    );
    describe_counter!(names::INVALIDATIONS_TOTAL, "Total number of invalidation calls");
    describe_counter!(
        names::INVALIDATED_KEYS_TOTAL,
        "Total number of cache keys removed by invalidation"
    );
    describe_counter!(
        names::BACKEND_ERRORS_TOTAL,
        "Total number of cache backend failures absorbed by the query cache"
    );

    describe_histogram!(names::EXECUTION_SECONDS, "Query executor duration in seconds");
    describe_histogram!(names::LOOKUP_SECONDS, "Cache backend lookup duration in seconds");

    describe_gauge!(names::HIT_RATE, "Running cache hit rate");
    describe_gauge!(names::QUERIES, "Queries seen since start");
    describe_gauge!(names::CACHED_QUERIES, "Queries served from cache since start");
    describe_gauge!(names::AVERAGE_EXECUTION_MS, "Running average execution time in milliseconds");
    describe_gauge!(names::AVERAGE_CACHE_MS, "Running average cache lookup time in milliseconds");
    describe_gauge!(names::TIME_SAVED_MS, "Estimated execution time saved by cache hits");
    describe_gauge!(names::TRACKED_ENTRIES, "Cache entries with tracked metadata");
    describe_gauge!(names::ENTITY_HIT_RATE, "Cache hit rate per entity kind");
}

/// Per-query metrics recorder.
#[derive(Clone)]
pub struct QueryMetrics;

impl QueryMetrics {
    /// Record a cache hit.
    pub fn hit(entity: &str, lookup: Duration) {
        counter!(names::HITS_TOTAL, "entity" => entity.to_string()).increment(1);
        histogram!(names::LOOKUP_SECONDS, "entity" => entity.to_string(), "result" => "hit")
            .record(lookup.as_secs_f64());
    }

    /// Record a cache miss.
    pub fn miss(entity: &str, lookup: Duration) {
        counter!(names::MISSES_TOTAL, "entity" => entity.to_string()).increment(1);
        histogram!(names::LOOKUP_SECONDS, "entity" => entity.to_string(), "result" => "miss")
            .record(lookup.as_secs_f64());
    }

    /// Record a query rejected by the complexity gate.
    pub fn uncacheable(entity: &str) {
        counter!(names::UNCACHEABLE_TOTAL, "entity" => entity.to_string()).increment(1);
    }

    /// Record a completed execution on the miss path.
    pub fn executed(entity: &str, duration: Duration, populated: bool) {
        histogram!(
            names::EXECUTION_SECONDS,
            "entity" => entity.to_string(),
            "populated" => populated.to_string()
        )
        .record(duration.as_secs_f64());

        if populated {
            counter!(names::POPULATIONS_TOTAL, "entity" => entity.to_string()).increment(1);
        }
    }

    /// Record an executor failure.
    pub fn execution_failed(entity: &str) {
        counter!(names::EXECUTION_ERRORS_TOTAL, "entity" => entity.to_string()).increment(1);
    }
}

/// Invalidation and backend metrics recorder.
#[derive(Clone)]
pub struct BackendMetrics;

impl BackendMetrics {
    /// Record an invalidation call.
    pub fn invalidated(entity: &str, trigger: &str, keys: u64) {
        counter!(
            names::INVALIDATIONS_TOTAL,
            "entity" => entity.to_string(),
            "trigger" => trigger.to_string()
        )
        .increment(1);
        counter!(names::INVALIDATED_KEYS_TOTAL, "entity" => entity.to_string()).increment(keys);
    }

    /// Record a swallowed backend failure.
    pub fn backend_error(operation: &str) {
        counter!(names::BACKEND_ERRORS_TOTAL, "operation" => operation.to_string()).increment(1);
    }
}

/// Gauge publisher for statistics snapshots.
#[derive(Clone)]
pub struct StatisticsGauges;

impl StatisticsGauges {
    /// Push every gauge from a snapshot.
    pub fn publish(instance: &str, stats: &RunningStatistics, tracked_entries: usize) {
        gauge!(names::HIT_RATE, "instance" => instance.to_string()).set(stats.hit_rate);
        gauge!(names::QUERIES, "instance" => instance.to_string()).set(stats.total_queries as f64);
        gauge!(names::CACHED_QUERIES, "instance" => instance.to_string())
            .set(stats.cached_queries as f64);
        gauge!(names::AVERAGE_EXECUTION_MS, "instance" => instance.to_string())
            .set(stats.average_execution_time_ms);
        gauge!(names::AVERAGE_CACHE_MS, "instance" => instance.to_string())
            .set(stats.average_cache_time_ms);
        gauge!(names::TIME_SAVED_MS, "instance" => instance.to_string()).set(stats.time_saved_ms);
        gauge!(names::TRACKED_ENTRIES, "instance" => instance.to_string())
            .set(tracked_entries as f64);

        for (entity, entity_stats) in &stats.per_entity {
            gauge!(
                names::ENTITY_HIT_RATE,
                "instance" => instance.to_string(),
                "entity" => entity.clone()
            )
            .set(entity_stats.hit_rate());
        }
    }
}
