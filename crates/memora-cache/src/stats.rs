//! Running statistics.
//!
//! Averages are cumulative since process start, updated incrementally as
//! `avg' = (avg * n + x) / (n + 1)`. A single short-lived lock guards the
//! aggregate; it is never held across an await point.

use crate::metadata::{CacheEntryMetadata, MetadataStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Per-entity-kind breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityStatistics {
    pub queries: u64,
    pub hits: u64,
    pub misses: u64,
    pub uncacheable: u64,
    pub failures: u64,
    pub populated: u64,
    pub average_execution_time_ms: f64,
}

impl EntityStatistics {
    /// Fraction of this kind's queries served from cache.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits, self.queries)
    }
}

/// One row of the "most accessed" list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessedEntry {
    pub key: String,
    pub entity_kind: String,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub execution_time_ms: f64,
}

impl From<CacheEntryMetadata> for AccessedEntry {
    fn from(meta: CacheEntryMetadata) -> Self {
        Self {
            key: meta.key,
            entity_kind: meta.entity_kind,
            access_count: meta.access_count,
            last_accessed_at: meta.last_accessed_at,
            execution_time_ms: meta.execution_time_ms,
        }
    }
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStatistics {
    /// Every query routed through an enabled cache, cacheable or not.
    pub total_queries: u64,
    pub cached_queries: u64,
    pub failed_queries: u64,
    pub hit_rate: f64,
    pub average_execution_time_ms: f64,
    /// Average backend lookup latency on hits.
    pub average_cache_time_ms: f64,
    /// Execution time avoided by hits, estimated from the populating run.
    pub time_saved_ms: f64,
    pub populated_entries: u64,
    pub backend_errors: u64,
    pub backend_errors_by_operation: BTreeMap<String, u64>,
    pub per_entity: BTreeMap<String, EntityStatistics>,
    pub most_accessed: Vec<AccessedEntry>,
}

#[derive(Debug, Default)]
struct Aggregate {
    total_queries: u64,
    cached_queries: u64,
    failed_queries: u64,
    executions: u64,
    average_execution_time_ms: f64,
    average_cache_time_ms: f64,
    time_saved_ms: f64,
    populated_entries: u64,
    backend_errors: HashMap<String, u64>,
    per_entity: HashMap<String, EntityStatistics>,
}

impl Aggregate {
    fn entity(&mut self, entity: &str) -> &mut EntityStatistics {
        self.per_entity.entry(entity.to_string()).or_default()
    }
}

/// Collects cache statistics from concurrent callers.
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    inner: Mutex<Aggregate>,
}

impl StatisticsAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A query rejected by the complexity gate.
    pub fn record_uncacheable(&self, entity: &str) {
        let mut agg = self.inner.lock();
        agg.total_queries += 1;
        let entity = agg.entity(entity);
        entity.queries += 1;
        entity.uncacheable += 1;
    }

    /// A query served from cache.
    pub fn record_hit(&self, entity: &str, lookup_time: Duration, saved_time: Duration) {
        let mut agg = self.inner.lock();
        agg.total_queries += 1;
        agg.average_cache_time_ms = running_average(
            agg.average_cache_time_ms,
            agg.cached_queries,
            millis(lookup_time),
        );
        agg.cached_queries += 1;
        agg.time_saved_ms += millis(saved_time);

        let entity = agg.entity(entity);
        entity.queries += 1;
        entity.hits += 1;
    }

    /// A miss whose executor completed.
    pub fn record_execution(&self, entity: &str, execution_time: Duration, populated: bool) {
        let elapsed = millis(execution_time);
        let mut agg = self.inner.lock();
        agg.total_queries += 1;
        agg.average_execution_time_ms =
            running_average(agg.average_execution_time_ms, agg.executions, elapsed);
        agg.executions += 1;
        if populated {
            agg.populated_entries += 1;
        }

        let entity = agg.entity(entity);
        entity.average_execution_time_ms =
            running_average(entity.average_execution_time_ms, entity.misses, elapsed);
        entity.queries += 1;
        entity.misses += 1;
        if populated {
            entity.populated += 1;
        }
    }

    /// A miss whose executor failed.
    pub fn record_failure(&self, entity: &str) {
        let mut agg = self.inner.lock();
        agg.total_queries += 1;
        agg.failed_queries += 1;
        let entity = agg.entity(entity);
        entity.queries += 1;
        entity.failures += 1;
    }

    /// A backend failure that was logged and swallowed.
    pub fn record_backend_error(&self, operation: &str) {
        *self
            .inner
            .lock()
            .backend_errors
            .entry(operation.to_string())
            .or_insert(0) += 1;
    }

    /// Snapshot including the `top_n` most accessed entries from `metadata`.
    #[must_use]
    pub fn snapshot(&self, metadata: &MetadataStore, top_n: usize) -> RunningStatistics {
        let mut stats = {
            let agg = self.inner.lock();
            RunningStatistics {
                total_queries: agg.total_queries,
                cached_queries: agg.cached_queries,
                failed_queries: agg.failed_queries,
                hit_rate: ratio(agg.cached_queries, agg.total_queries),
                average_execution_time_ms: agg.average_execution_time_ms,
                average_cache_time_ms: agg.average_cache_time_ms,
                time_saved_ms: agg.time_saved_ms,
                populated_entries: agg.populated_entries,
                backend_errors: agg.backend_errors.values().sum(),
                backend_errors_by_operation: agg
                    .backend_errors
                    .iter()
                    .map(|(op, count)| (op.clone(), *count))
                    .collect(),
                per_entity: agg
                    .per_entity
                    .iter()
                    .map(|(kind, stats)| (kind.clone(), stats.clone()))
                    .collect(),
                most_accessed: Vec::new(),
            }
        };

        stats.most_accessed = metadata
            .top_accessed(top_n)
            .into_iter()
            .map(AccessedEntry::from)
            .collect();
        stats
    }
}

fn running_average(average: f64, count: u64, sample: f64) -> f64 {
    (average * count as f64 + sample) / (count as f64 + 1.0)
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
