//! # Memora Cache
//!
//! Transparent query-result cache for a document data-access layer.
//!
//! For every read the [`QueryCacheService`] scores the query shape, looks the
//! fingerprint up in the cache backend and, on a miss, times the real
//! execution to decide whether the result is worth storing. Writes elsewhere
//! in the platform call [`QueryCacheService::invalidate_model`] so that cached
//! results derived from the changed entity kind are dropped.
//!
//! ```ignore
//! let service = QueryCacheService::new(backend, &config.cache);
//!
//! let prepared = service
//!     .prepare(QueryRequest::fetch_many("Ticket", json!({"title": {"$regex": "urgent"}})), || async {
//!         repository.find_tickets().await
//!     })
//!     .await;
//! let outcome = prepared.execute().await?;
//! ```

pub mod analyzer;
pub mod cache;
pub mod di;
pub mod invalidation;
pub mod metadata;
pub mod metrics;
pub mod query;
pub mod reporter;
pub mod service;
pub mod stats;

pub use analyzer::{ComplexityAnalyzer, ComplexityScore};
pub use cache::*;
pub use di::{build_backend, build_cache_module, CacheModule};
pub use invalidation::{InvalidationManager, InvalidationReport};
pub use metadata::{CacheEntryMetadata, MetadataStore};
pub use query::*;
pub use reporter::StatisticsReporter;
pub use service::{PreparedQuery, QueryCacheService, QueryOutcome, WarmReport, WarmupExecutor, WarmupQuery};
pub use stats::{AccessedEntry, EntityStatistics, RunningStatistics, StatisticsAggregator};
