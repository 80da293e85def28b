//! Integration tests for the query cache.
//!
//! Run against the in-memory backend wrapped in a recording double; no
//! external Redis is needed.

mod common;

use common::{eager_config, regex_request, service_with, slow, RecordingBackend};
use memora_cache::{
    CacheBackend, CacheExt, ComplexityAnalyzer, KeyGenerator, OperationKind, QueryOptions, QueryRequest,
    QueryShape, SetOptions, StatisticsReporter, WarmupQuery, WriteOperation,
};
use memora_config::CacheConfig;
use memora_core::MemoraError;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn scenario_a_simple_filter_executes_directly() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &CacheConfig::default());

    let score = service
        .analyzer()
        .score(&QueryShape::new(OperationKind::FetchMany, json!({"status": "open"})));
    assert!(score.score < 1.0);
    assert!(!score.cacheable);

    for _ in 0..3 {
        let outcome = service
            .run(QueryRequest::fetch_many("Ticket", json!({"status": "open"})), || {
                slow(vec!["T1".to_string(); 2], Duration::from_millis(60))
            })
            .await
            .unwrap();
        assert!(!outcome.from_cache);
        assert_eq!(outcome.execution_time, Duration::ZERO);
    }

    assert_eq!(backend.gets(), 0);
    assert_eq!(backend.sets(), 0);
    assert_eq!(service.get_statistics().total_queries, 3);
}

#[tokio::test]
async fn scenario_b_slow_regex_query_is_cached() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &CacheConfig::default());
    let score = service.analyzer().score(&regex_request().shape);
    assert!(score.cacheable);
    assert!(score.score >= 40.0);

    let first = service
        .run(regex_request(), || slow(json!([{"id": "T123"}]), Duration::from_millis(80)))
        .await
        .unwrap();
    assert!(!first.from_cache);
    assert!(first.populated);
    assert!(first.execution_time >= Duration::from_millis(80));

    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let second = service
        .run(regex_request(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!([]))
        })
        .await
        .unwrap();

    assert!(second.from_cache);
    assert_eq!(second.value, json!([{"id": "T123"}]));
    assert!(second.execution_time < Duration::from_millis(50));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let stats = service.get_statistics();
    assert_eq!(stats.total_queries, 2);
    assert_eq!(stats.cached_queries, 1);
    assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    assert!(stats.time_saved_ms > 0.0);
}

#[tokio::test]
async fn scenario_c_update_invalidates_populated_key() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());

    let prepared = service.prepare(regex_request(), || async { Ok(json!(["T123"])) }).await;
    let key = prepared.cache_key().unwrap();
    prepared.execute().await.unwrap();

    let metadata = service.get_query_metadata();
    assert_eq!(metadata[0].tags, vec!["model:Ticket".to_string()]);
    assert!(backend.inner.get_raw(&key).await.unwrap().is_some());

    let report = service
        .invalidate_model("Ticket", WriteOperation::Update, Some("T123"), &[])
        .await;
    assert!(report.is_clean());
    assert!(report.keys_deleted >= 1);
    assert!(backend.inner.get_raw(&key).await.unwrap().is_none());

    let again = service
        .run(regex_request(), || async { Ok(json!(["T123", "T124"])) })
        .await
        .unwrap();
    assert!(!again.from_cache);
    assert_eq!(again.value, json!(["T123", "T124"]));
}

#[tokio::test]
async fn scenario_d_backend_timeout_falls_through() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    backend.fail_get.store(true, Ordering::SeqCst);

    let outcome = service
        .run(regex_request(), || async { Ok(json!({"count": 3})) })
        .await
        .unwrap();

    assert!(!outcome.from_cache);
    assert_eq!(outcome.value, json!({"count": 3}));
    assert_eq!(service.get_statistics().backend_errors_by_operation["get"], 1);
}

#[tokio::test]
async fn cacheability_gate_keeps_trivial_queries_out() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    let filters = [
        json!({}),
        json!({"status": "open"}),
        json!({"_id": "T1"}),
        json!({"priority": {"$gte": 3}}),
    ];

    for filter in filters {
        service
            .run(QueryRequest::fetch_one("Ticket", filter), || async { Ok(1u64) })
            .await
            .unwrap();
    }

    assert!(backend.inner.is_empty());
    assert_eq!(service.get_statistics().per_entity["Ticket"].uncacheable, 4);
}

#[tokio::test]
async fn upper_bound_rejects_runaway_queries() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    let request = QueryRequest::aggregate(
        "Ticket",
        json!([
            {"$match": {"title": {"$regex": "a"}, "$text": {"$search": "b"}}},
            {"$geoNear": {"$near": [0, 0]}},
            {"$lookup": {"from": "sites"}},
            {"$group": {"_id": "$site"}},
            {"pad": "x".repeat(6000)}
        ]),
    )
    .with_options(QueryOptions::new().with_sort(json!({"a": 1})).include("Site").with_limit(5000));

    service.run(request, || async { Ok(0u64) }).await.unwrap();
    assert!(backend.inner.is_empty());
}

#[tokio::test]
async fn threshold_gate_keeps_fast_queries_out() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &CacheConfig::default());

    let outcome = service.run(regex_request(), || async { Ok(json!([])) }).await.unwrap();

    assert!(!outcome.populated);
    assert_eq!(backend.gets(), 1);
    assert_eq!(backend.sets(), 0);
    assert!(backend.inner.is_empty());
}

#[tokio::test]
async fn invalidate_by_entity_twice_matches_once() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    service.run(regex_request(), || async { Ok(1u64) }).await.unwrap();
    service
        .run(regex_request().with_options(QueryOptions::new().with_limit(5)), || async { Ok(2u64) })
        .await
        .unwrap();
    let manager = service.invalidation_manager();
    assert_eq!(manager.dependents("Ticket").len(), 2);

    let first = manager.invalidate_by_entity("Ticket", WriteOperation::Delete, None).await;
    assert_eq!(first.dependents_cleared, 2);
    assert!(manager.dependents("Ticket").is_empty());
    assert!(backend.inner.is_empty());

    let second = manager.invalidate_by_entity("Ticket", WriteOperation::Delete, None).await;
    assert_eq!(second.dependents_cleared, 0);
    assert_eq!(second.keys_deleted, 0);
    assert!(manager.dependents("Ticket").is_empty());
    assert!(backend.inner.is_empty());
}

#[tokio::test]
async fn dependent_kind_write_invalidates_joined_query() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    let request = regex_request()
        .with_options(QueryOptions::new().include("Site"))
        .depends_on("Site");

    service.run(request.clone(), || async { Ok(json!(["T1"])) }).await.unwrap();
    assert!(service.prepare(request.clone(), || async { Ok(json!([])) }).await.from_cache());

    service
        .invalidate_model("Site", WriteOperation::Update, Some("S1"), &[])
        .await;

    assert!(backend.inner.is_empty());
    assert!(!service.prepare(request, || async { Ok(json!([])) }).await.from_cache());
}

#[tokio::test]
async fn partial_invalidation_failure_still_clears_bookkeeping() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    service.run(regex_request(), || async { Ok(1u64) }).await.unwrap();
    backend.fail_delete.store(true, Ordering::SeqCst);

    let report = service
        .invalidate_model("Ticket", WriteOperation::Update, None, &[])
        .await;

    // The pattern sweep removed the entry; the per-key delete failed.
    assert_eq!(report.failures, 1);
    assert!(backend.inner.is_empty());
    assert!(service.get_query_metadata().is_empty());
    assert!(service.invalidation_manager().dependents("Ticket").is_empty());
}

#[tokio::test]
async fn expired_entries_are_reclaimed_in_the_background() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    for n in 0..20 {
        let request = QueryRequest::fetch_many("Ticket", json!({"title": {"$regex": format!("t{n}")}}))
            .with_ttl(Duration::from_millis(5));
        service.run(request, || async { Ok(n) }).await.unwrap();
    }
    assert_eq!(backend.inner.len(), 20);
    assert_eq!(service.tracked_entries(), 20);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let reporter = Arc::new(StatisticsReporter::new(service.clone(), Duration::from_millis(10)));
    let handle = reporter.clone().spawn();
    for _ in 0..100 {
        if service.tracked_entries() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    reporter.stop();
    handle.await.unwrap();

    assert!(backend.inner.is_empty());
    assert_eq!(service.tracked_entries(), 0);
    assert_eq!(service.invalidation_manager().edge_count(), 0);
}

#[tokio::test]
async fn backend_round_trip_returns_exact_value() {
    let backend = RecordingBackend::new();
    let value = json!({"tickets": [{"id": 1, "title": "Printer on fire", "tags": ["hw", "urgent"]}], "total": 1.5});

    backend
        .set("k", &value, &SetOptions::with_ttl(Duration::from_secs(60)))
        .await
        .unwrap();
    let read: Option<Value> = backend.get("k").await.unwrap();

    assert_eq!(read, Some(value));
}

#[test]
fn key_generation_ignores_object_key_order() {
    let keys = KeyGenerator::new("memora:query");
    let pairs = [
        (r#"{"a":1,"b":{"c":2,"d":[{"x":1,"y":2}]}}"#, r#"{"b":{"d":[{"y":2,"x":1}],"c":2},"a":1}"#),
        (r#"{"status":"open","priority":3}"#, r#"{"priority":3,"status":"open"}"#),
    ];

    for (left, right) in pairs {
        let left: Value = serde_json::from_str(left).unwrap();
        let right: Value = serde_json::from_str(right).unwrap();
        assert_eq!(
            keys.generate("Ticket", &QueryShape::new(OperationKind::FetchMany, left)),
            keys.generate("Ticket", &QueryShape::new(OperationKind::FetchMany, right))
        );
    }
}

#[test]
fn key_generation_separates_distinct_shapes() {
    let keys = KeyGenerator::new("memora:query");
    let mut seen = HashSet::new();
    let mut generated = 0;

    for i in 0..50u64 {
        let filters = [json!({"n": i}), json!({"title": {"$regex": format!("t{}", i)}})];
        for filter in filters {
            let variants = [
                QueryOptions::new(),
                QueryOptions::new().with_limit(i + 1),
                QueryOptions::new().with_offset(i + 1),
                QueryOptions::new().with_sort(json!({ format!("f{}", i): -1 })),
                QueryOptions::new().with_projection(json!({ format!("p{}", i): 1 })),
            ];
            for options in variants {
                let shape = QueryShape::new(OperationKind::FetchMany, filter.clone()).with_options(options);
                seen.insert(keys.generate("Ticket", &shape));
                generated += 1;
            }
        }
    }

    assert_eq!(seen.len(), generated);
}

#[test]
fn adding_expensive_predicates_never_lowers_score() {
    let analyzer = ComplexityAnalyzer::default();
    let base = json!({"status": "open"});
    let extensions = [
        json!({"status": "open", "title": {"$regex": "x"}}),
        json!({"status": "open", "title": {"$regex": "x"}, "$text": {"$search": "y"}}),
        json!({"status": "open", "title": {"$regex": "x"}, "$text": {"$search": "y"}, "loc": {"$nearSphere": [1, 2]}}),
    ];

    let mut previous = analyzer.score(&QueryShape::new(OperationKind::FetchMany, base)).score;
    for filter in extensions {
        let score = analyzer.score(&QueryShape::new(OperationKind::FetchMany, filter)).score;
        assert!(score >= previous);
        previous = score;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_prepare_for_one_key_stays_consistent() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .run(regex_request(), || slow(json!(["T1"]), Duration::from_millis(20)))
                    .await
            })
        })
        .collect();

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.value, json!(["T1"]));
    }

    assert_eq!(backend.inner.len(), 1);
    assert_eq!(service.get_query_metadata().len(), 1);
    assert_eq!(service.invalidation_manager().dependents("Ticket").len(), 1);
    assert_eq!(service.get_statistics().total_queries, 16);
}

#[tokio::test]
async fn population_failure_still_returns_result() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    backend.fail_set.store(true, Ordering::SeqCst);

    let outcome = service.run(regex_request(), || async { Ok(json!([1, 2, 3])) }).await.unwrap();

    assert_eq!(outcome.value, json!([1, 2, 3]));
    assert!(!outcome.populated);
    assert_eq!(backend.sets(), 1);
    assert!(service.get_query_metadata().is_empty());
    assert!(service.invalidation_manager().dependents("Ticket").is_empty());
    assert_eq!(service.get_statistics().backend_errors_by_operation["set"], 1);
}

#[tokio::test]
async fn execution_error_propagates_and_nothing_is_cached() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());

    let result = service
        .run::<Value, _, _>(regex_request(), || async { Err(MemoraError::execution("connection refused")) })
        .await;

    match result {
        Err(MemoraError::Execution(message)) => assert_eq!(message, "connection refused"),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(backend.sets(), 0);
    assert!(backend.inner.is_empty());
}

#[tokio::test]
async fn warm_populates_and_tolerates_failures() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());

    let descriptors = || {
        vec![
            WarmupQuery::new(regex_request(), || async { Ok(json!(["T1"])) }),
            WarmupQuery::new(
                QueryRequest::fetch_many("Site", json!({"$text": {"$search": "depot"}})),
                || async { Err(MemoraError::execution("site store offline")) },
            ),
            WarmupQuery::new(QueryRequest::count("Ticket", json!({"status": "open"})), || async {
                Ok(json!(4))
            }),
        ]
    };

    let first = service.warm(descriptors()).await;
    assert_eq!(first.attempted, 3);
    assert_eq!(first.populated, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.skipped, 1);

    let second = service.warm(descriptors()).await;
    assert_eq!(second.already_cached, 1);
    assert_eq!(second.failed, 1);
}

#[tokio::test]
async fn disabled_switch_bypasses_backend() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &CacheConfig::disabled());
    assert!(!service.is_enabled());

    service.run(regex_request(), || async { Ok(1u64) }).await.unwrap();
    assert_eq!(backend.gets(), 0);
    assert_eq!(service.get_statistics().total_queries, 0);

    service.set_enabled(true);
    let outcome = service.run(regex_request(), || slow(1u64, Duration::from_millis(60))).await.unwrap();
    assert!(outcome.populated);
    assert_eq!(backend.gets(), 1);
}

#[tokio::test]
async fn manual_invalidate_by_pattern_and_tag() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    service.run(regex_request(), || async { Ok(1u64) }).await.unwrap();
    service
        .run(QueryRequest::fetch_many("Site", json!({"name": {"$regex": "^North"}})), || async {
            Ok(2u64)
        })
        .await
        .unwrap();

    let pattern = service.keys().entity_pattern("Ticket");
    assert_eq!(service.invalidate(Some(&pattern), &[]).await, 1);
    assert_eq!(service.invalidate(None, &["model:Site".to_string()]).await, 1);
    assert!(backend.inner.is_empty());
    assert!(service.invalidation_manager().tracked_kinds().is_empty());
}

#[tokio::test]
async fn convenience_methods_use_distinct_keys() {
    let backend = RecordingBackend::new();
    let service = service_with(backend.clone(), &eager_config());
    let filter = json!({"title": {"$regex": "abc"}});

    service
        .fetch_many("Ticket", filter.clone(), QueryOptions::new(), || async { Ok(json!([])) })
        .await
        .unwrap();
    service
        .fetch_one("Ticket", filter.clone(), QueryOptions::new(), || async { Ok(json!(null)) })
        .await
        .unwrap();
    service
        .count("Ticket", filter.clone(), QueryOptions::new(), || async { Ok(0u64) })
        .await
        .unwrap();
    service
        .aggregate(
            "Ticket",
            json!([{"$match": filter}, {"$group": {"_id": "$status"}}]),
            QueryOptions::new(),
            || async { Ok(json!([])) },
        )
        .await
        .unwrap();

    assert_eq!(backend.inner.len(), 4);
    let count = service
        .count("Ticket", json!({"title": {"$regex": "abc"}}), QueryOptions::new(), || async { Ok(99u64) })
        .await
        .unwrap();
    assert!(count.from_cache);
    assert_eq!(count.value, 0);
}
