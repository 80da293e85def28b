//! Dependency-tracked invalidation.
//!
//! The dependency map `entity kind -> cache keys` is the source of truth.
//! Pattern and tag sweeps run alongside it to catch keys written before the
//! map existed, e.g. after a restart. Every backend call is best effort: a
//! failure is counted and the remaining work still runs.

use crate::cache::cache_keys::model_tag;
use crate::cache::{CacheBackend, InvalidationRequest, KeyGenerator};
use crate::metadata::MetadataStore;
use crate::metrics::BackendMetrics;
use crate::query::WriteOperation;
use crate::stats::StatisticsAggregator;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one invalidation call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationReport {
    /// Pattern, prefix and tag sweeps sent to the backend.
    pub patterns_issued: usize,
    /// Keys the backend reported as deleted.
    pub keys_deleted: u64,
    /// Tracked dependent keys processed.
    pub dependents_cleared: usize,
    /// Backend calls that failed.
    pub failures: usize,
}

impl InvalidationReport {
    /// True when no backend call failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures == 0
    }
}

/// Collects failures so one call logs one warning.
#[derive(Default)]
struct FailureLog {
    first: Option<String>,
    count: usize,
}

impl FailureLog {
    fn push(&mut self, message: String) {
        self.count += 1;
        self.first.get_or_insert(message);
    }
}

/// Tracks which cache keys derive from which entity kinds and removes them
/// when those kinds change.
pub struct InvalidationManager {
    backend: Arc<dyn CacheBackend>,
    keys: KeyGenerator,
    metadata: Arc<MetadataStore>,
    stats: Arc<StatisticsAggregator>,
    dependencies: RwLock<HashMap<String, HashSet<String>>>,
}

impl InvalidationManager {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        keys: KeyGenerator,
        metadata: Arc<MetadataStore>,
        stats: Arc<StatisticsAggregator>,
    ) -> Self {
        Self {
            backend,
            keys,
            metadata,
            stats,
            dependencies: RwLock::new(HashMap::new()),
        }
    }

    /// Records that `cache_key` derives from `entity_kind`. Idempotent.
    pub fn register_dependency(&self, cache_key: &str, entity_kind: &str) {
        self.dependencies
            .write()
            .entry(entity_kind.to_string())
            .or_default()
            .insert(cache_key.to_string());
    }

    /// Records one edge per entity kind.
    pub fn register_dependencies(&self, cache_key: &str, entity_kinds: &[String]) {
        let mut dependencies = self.dependencies.write();
        for kind in entity_kinds {
            dependencies
                .entry(kind.clone())
                .or_default()
                .insert(cache_key.to_string());
        }
    }

    /// Keys currently depending on `entity_kind`, sorted.
    #[must_use]
    pub fn dependents(&self, entity_kind: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .dependencies
            .read()
            .get(entity_kind)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Entity kinds with at least one dependent key, sorted.
    #[must_use]
    pub fn tracked_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.dependencies.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Total number of dependency edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.dependencies.read().values().map(HashSet::len).sum()
    }

    /// Removes `cache_key` from every dependency set.
    pub fn forget_key(&self, cache_key: &str) {
        self.forget_keys(std::slice::from_ref(&cache_key.to_string()));
    }

    pub(crate) fn forget_keys(&self, cache_keys: &[String]) {
        if cache_keys.is_empty() {
            return;
        }
        let mut dependencies = self.dependencies.write();
        for keys in dependencies.values_mut() {
            for key in cache_keys {
                keys.remove(key);
            }
        }
        dependencies.retain(|_, keys| !keys.is_empty());
    }

    fn forget_matching(&self, pattern: &str) {
        let mut dependencies = self.dependencies.write();
        for keys in dependencies.values_mut() {
            keys.retain(|key| !crate::cache::pattern::glob_match(pattern, key));
        }
        dependencies.retain(|_, keys| !keys.is_empty());
    }

    async fn sweep(
        &self,
        request: InvalidationRequest,
        report: &mut InvalidationReport,
        failures: &mut FailureLog,
    ) {
        report.patterns_issued += 1;
        match self.backend.invalidate(&request).await {
            Ok(deleted) => report.keys_deleted += deleted,
            Err(e) => {
                self.stats.record_backend_error("invalidate");
                BackendMetrics::backend_error("invalidate");
                failures.push(format!("{:?}: {}", request, e));
            }
        }
    }

    /// Invalidates everything derived from `entity_kind` after a write.
    ///
    /// Sweeps the entity pattern, the document pattern when an id is given
    /// and the `model:{kind}` tag, then deletes every tracked dependent key
    /// one by one and clears the kind's dependency set.
    pub async fn invalidate_by_entity(
        &self,
        entity_kind: &str,
        operation: WriteOperation,
        document_id: Option<&str>,
    ) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        let mut failures = FailureLog::default();
        let entity_pattern = self.keys.entity_pattern(entity_kind);
        let tag = model_tag(entity_kind);

        self.sweep(InvalidationRequest::pattern(entity_pattern.clone()), &mut report, &mut failures)
            .await;
        if let Some(id) = document_id {
            let pattern = self.keys.document_pattern(id);
            self.sweep(InvalidationRequest::pattern(pattern), &mut report, &mut failures)
                .await;
        }
        self.sweep(InvalidationRequest::tags([tag.clone()]), &mut report, &mut failures)
            .await;

        let dependents: Vec<String> = self
            .dependencies
            .write()
            .remove(entity_kind)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();

        for key in &dependents {
            match self.backend.delete(key).await {
                Ok(true) => report.keys_deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    self.stats.record_backend_error("delete");
                    BackendMetrics::backend_error("delete");
                    failures.push(format!("delete {}: {}", key, e));
                }
            }
            self.metadata.remove(key);
        }
        report.dependents_cleared = dependents.len();
        self.forget_keys(&dependents);

        let mut swept = self.metadata.remove_matching(&entity_pattern);
        swept.extend(self.metadata.remove_tagged(std::slice::from_ref(&tag)));
        self.forget_keys(&swept);

        self.finish(entity_kind, operation.as_str(), &mut report, failures);
        report
    }

    /// Coarse field-level invalidation: one pattern sweep per field, without
    /// consulting the dependency map.
    pub async fn invalidate_by_fields(&self, entity_kind: &str, fields: &[String]) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        let mut failures = FailureLog::default();

        for field in fields {
            let pattern = self.keys.field_pattern(entity_kind, field);
            self.sweep(InvalidationRequest::pattern(pattern.clone()), &mut report, &mut failures)
                .await;
            let removed = self.metadata.remove_matching(&pattern);
            self.forget_keys(&removed);
        }

        self.finish(entity_kind, "fields", &mut report, failures);
        report
    }

    /// Manual invalidation by glob pattern and/or tags.
    pub async fn invalidate_matching(&self, pattern: Option<&str>, tags: &[String]) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        let mut failures = FailureLog::default();

        let request = InvalidationRequest {
            prefix: None,
            pattern: pattern.map(str::to_string),
            tags: tags.to_vec(),
        };
        if request.is_empty() {
            return report;
        }
        self.sweep(request, &mut report, &mut failures).await;

        if let Some(pattern) = pattern {
            self.metadata.remove_matching(pattern);
            self.forget_matching(pattern);
        }
        let removed = self.metadata.remove_tagged(tags);
        self.forget_keys(&removed);

        self.finish(pattern.unwrap_or("*"), "manual", &mut report, failures);
        report
    }

    fn finish(&self, entity: &str, trigger: &str, report: &mut InvalidationReport, failures: FailureLog) {
        report.failures = failures.count;
        BackendMetrics::invalidated(entity, trigger, report.keys_deleted);

        if let Some(first) = failures.first {
            warn!(
                entity = %entity,
                trigger = %trigger,
                failures = failures.count,
                first_error = %first,
                backend = self.backend.name(),
                "Cache invalidation partially failed"
            );
        }

        if report.keys_deleted > 0 || report.dependents_cleared > 0 {
            info!(
                entity = %entity,
                trigger = %trigger,
                keys_deleted = report.keys_deleted,
                dependents = report.dependents_cleared,
                patterns = report.patterns_issued,
                "Invalidated cached queries"
            );
        } else {
            debug!(entity = %entity, trigger = %trigger, "Invalidation found nothing to remove");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryCacheBackend, SetOptions};
    use crate::metadata::tests::metadata as sample_metadata;
    use async_trait::async_trait;
    use memora_core::{MemoraError, MemoraResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn manager_with(
        backend: Arc<dyn CacheBackend>,
    ) -> (InvalidationManager, Arc<MetadataStore>, Arc<StatisticsAggregator>) {
        let metadata = Arc::new(MetadataStore::new());
        let stats = Arc::new(StatisticsAggregator::new());
        let manager = InvalidationManager::new(
            backend,
            KeyGenerator::new("q"),
            metadata.clone(),
            stats.clone(),
        );
        (manager, metadata, stats)
    }

    /// Backend whose deletes fail for keys containing "bad".
    struct FlakyBackend {
        inner: InMemoryCacheBackend,
        invalidate_calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        async fn get_raw(&self, key: &str) -> MemoraResult<Option<String>> {
            self.inner.get_raw(key).await
        }
        async fn set_raw(&self, key: &str, value: &str, options: &SetOptions) -> MemoraResult<()> {
            self.inner.set_raw(key, value, options).await
        }
        async fn delete(&self, key: &str) -> MemoraResult<bool> {
            if key.contains("bad") {
                return Err(MemoraError::cache("connection reset"));
            }
            self.inner.delete(key).await
        }
        async fn invalidate(&self, _request: &InvalidationRequest) -> MemoraResult<u64> {
            self.invalidate_calls.fetch_add(1, Ordering::SeqCst);
            Err(MemoraError::Timeout("invalidate".to_string()))
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    async fn store(backend: &dyn CacheBackend, key: &str, tags: &[&str]) {
        let options = SetOptions::with_ttl(Duration::from_secs(60)).tagged(tags.iter().map(|t| t.to_string()));
        backend.set_raw(key, "[]", &options).await.unwrap();
    }

    #[test]
    fn test_register_is_idempotent() {
        let (manager, _, _) = manager_with(Arc::new(InMemoryCacheBackend::new()));
        manager.register_dependency("k1", "Ticket");
        manager.register_dependency("k1", "Ticket");
        manager.register_dependencies("k2", &["Ticket".to_string(), "Site".to_string()]);

        assert_eq!(manager.dependents("Ticket"), vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(manager.tracked_kinds(), vec!["Site".to_string(), "Ticket".to_string()]);
        assert_eq!(manager.edge_count(), 3);
    }

    #[test]
    fn test_forget_key_drops_empty_sets() {
        let (manager, _, _) = manager_with(Arc::new(InMemoryCacheBackend::new()));
        manager.register_dependencies("k2", &["Ticket".to_string(), "Site".to_string()]);
        manager.register_dependency("k1", "Ticket");

        manager.forget_key("k2");
        assert_eq!(manager.dependents("Ticket"), vec!["k1".to_string()]);
        assert!(manager.dependents("Site").is_empty());
        assert_eq!(manager.tracked_kinds(), vec!["Ticket".to_string()]);
    }

    #[tokio::test]
    async fn test_invalidate_by_entity_removes_dependents() {
        let backend = Arc::new(InMemoryCacheBackend::new());
        let (manager, metadata, _) = manager_with(backend.clone());

        // Keyed under Site but dependent on Ticket through an include.
        store(backend.as_ref(), "q:Site:joined", &["model:Site"]).await;
        metadata.insert(metadata_for("q:Site:joined", "Site"));
        manager.register_dependencies("q:Site:joined", &["Site".to_string(), "Ticket".to_string()]);

        store(backend.as_ref(), "q:Ticket:a", &["model:Ticket"]).await;
        metadata.insert(metadata_for("q:Ticket:a", "Ticket"));
        manager.register_dependency("q:Ticket:a", "Ticket");

        let report = manager
            .invalidate_by_entity("Ticket", WriteOperation::Update, Some("T123"))
            .await;

        assert!(report.is_clean());
        assert_eq!(report.patterns_issued, 3);
        assert_eq!(report.dependents_cleared, 2);
        assert_eq!(report.keys_deleted, 2);
        assert!(backend.is_empty());
        assert!(metadata.is_empty());
        assert!(manager.dependents("Ticket").is_empty());
        assert!(manager.dependents("Site").is_empty());
    }

    fn metadata_for(key: &str, entity: &str) -> crate::metadata::CacheEntryMetadata {
        sample_metadata(key, entity, &[])
    }

    #[tokio::test]
    async fn test_invalidate_by_entity_is_idempotent() {
        let backend = Arc::new(InMemoryCacheBackend::new());
        let (manager, _, _) = manager_with(backend.clone());
        store(backend.as_ref(), "q:Ticket:a", &["model:Ticket"]).await;
        manager.register_dependency("q:Ticket:a", "Ticket");

        manager.invalidate_by_entity("Ticket", WriteOperation::Delete, None).await;
        let second = manager.invalidate_by_entity("Ticket", WriteOperation::Delete, None).await;

        assert_eq!(second.keys_deleted, 0);
        assert_eq!(second.dependents_cleared, 0);
        assert!(manager.dependents("Ticket").is_empty());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_partial_failure_continues() {
        let backend = Arc::new(FlakyBackend {
            inner: InMemoryCacheBackend::new(),
            invalidate_calls: AtomicUsize::new(0),
        });
        let (manager, metadata, stats) = manager_with(backend.clone());
        for key in ["q:Ticket:bad", "q:Ticket:good1", "q:Ticket:good2"] {
            store(&backend.inner, key, &[]).await;
            metadata.insert(metadata_for(key, "Ticket"));
            manager.register_dependency(key, "Ticket");
        }

        let report = manager
            .invalidate_by_entity("Ticket", WriteOperation::Update, Some("T1"))
            .await;

        assert_eq!(backend.invalidate_calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.failures, 4);
        assert_eq!(report.keys_deleted, 2);
        assert_eq!(backend.inner.len(), 1);
        assert!(metadata.is_empty());
        assert!(manager.dependents("Ticket").is_empty());
        assert_eq!(stats.snapshot(&metadata, 0).backend_errors, 4);
    }

    #[tokio::test]
    async fn test_invalidate_by_fields_skips_dependency_map() {
        let backend = Arc::new(InMemoryCacheBackend::new());
        let (manager, _, _) = manager_with(backend.clone());
        store(backend.as_ref(), "q:Ticket:x:status:1", &[]).await;
        store(backend.as_ref(), "q:Ticket:y", &[]).await;
        manager.register_dependency("q:Ticket:y", "Ticket");

        let report = manager
            .invalidate_by_fields("Ticket", &["status".to_string(), "title".to_string()])
            .await;

        assert_eq!(report.patterns_issued, 2);
        assert_eq!(report.keys_deleted, 1);
        assert_eq!(backend.len(), 1);
        assert_eq!(manager.dependents("Ticket"), vec!["q:Ticket:y".to_string()]);
    }

    #[tokio::test]
    async fn test_invalidate_matching() {
        let backend = Arc::new(InMemoryCacheBackend::new());
        let (manager, metadata, _) = manager_with(backend.clone());
        store(backend.as_ref(), "q:Ticket:a", &["model:Ticket"]).await;
        store(backend.as_ref(), "q:Site:a", &["model:Site"]).await;
        metadata.insert(sample_metadata("q:Site:a", "Site", &["model:Site"]));
        manager.register_dependency("q:Ticket:a", "Ticket");
        manager.register_dependency("q:Site:a", "Site");

        let report = manager
            .invalidate_matching(Some("q:Ticket:*"), &["model:Site".to_string()])
            .await;

        assert_eq!(report.keys_deleted, 2);
        assert!(backend.is_empty());
        assert!(metadata.is_empty());
        assert!(manager.tracked_kinds().is_empty());

        let empty = manager.invalidate_matching(None, &[]).await;
        assert_eq!(empty.patterns_issued, 0);
        assert!(empty.is_clean());
    }

    #[tokio::test]
    async fn test_sweep_failures_reported_for_fields_and_manual() {
        let backend = Arc::new(FlakyBackend {
            inner: InMemoryCacheBackend::new(),
            invalidate_calls: AtomicUsize::new(0),
        });
        let (manager, _, stats) = manager_with(backend.clone());

        let by_fields = manager
            .invalidate_by_fields("Ticket", &["status".to_string(), "title".to_string()])
            .await;
        assert_eq!(by_fields.failures, 2);
        assert!(!by_fields.is_clean());

        let manual = manager
            .invalidate_matching(Some("q:*"), &["model:Ticket".to_string()])
            .await;
        assert_eq!(manual.failures, 1);
        assert!(!manual.is_clean());

        let metadata = MetadataStore::new();
        assert_eq!(stats.snapshot(&metadata, 0).backend_errors_by_operation["invalidate"], 3);
    }
}
