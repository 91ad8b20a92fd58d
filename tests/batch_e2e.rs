// tests/batch_e2e.rs
//
// End-to-end batch run over the file-backed store: decisions land on
// disk, the summary accounts for every customer, and a replay of the
// same batch is idempotent.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use nba_engine::batch;
use nba_engine::config::EngineConfig;
use nba_engine::enhance::MockClient;
use nba_engine::record::RawInteraction;
use nba_engine::{Engine, JsonStore, Storage};

fn raw(customer: &str, id: &str, ts: &str, direction: &str, text: &str) -> RawInteraction {
    RawInteraction {
        source_record_id: Some(id.to_string()),
        customer_id: customer.to_string(),
        channel: "twitter".into(),
        direction: direction.into(),
        timestamp: ts.into(),
        text: text.into(),
    }
}

fn seed(dir: &std::path::Path) {
    let records = vec![
        raw("cust_a", "1", "2024-06-01T10:00:00Z", "inbound", "order is late"),
        raw("cust_a", "2", "2024-06-01T10:05:00Z", "inbound", "hello??"),
        raw("cust_b", "3", "2024-06-01T09:00:00Z", "inbound", "thanks, great service"),
        raw("cust_b", "4", "2024-06-01T09:02:00Z", "outbound", "happy to help"),
        // This record bounces off the gate; cust_c still resolves from the rest.
        raw("cust_c", "5", "not-a-timestamp", "inbound", "broken"),
        raw("cust_c", "6", "2024-06-01T08:00:00Z", "inbound", "it is broken"),
    ];
    std::fs::write(
        dir.join("records.json"),
        serde_json::to_string_pretty(&records).unwrap(),
    )
    .unwrap();
}

fn engine_with_mock() -> Arc<Engine> {
    let cfg = EngineConfig {
        llm_timeout_secs: 1,
        llm_max_retries: 0,
        llm_backoff_ms: 1,
        ..EngineConfig::default()
    };
    Arc::new(Engine::new(
        cfg,
        Some(Arc::new(MockClient { confidence: 0.9 })),
    ))
}

fn eval_instant() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[tokio::test]
async fn batch_writes_one_decision_per_customer() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let storage: Arc<dyn Storage> = Arc::new(JsonStore::open(dir.path()).unwrap());

    let summary = batch::run(engine_with_mock(), Arc::clone(&storage), None, 4, eval_instant())
        .await
        .unwrap();

    assert_eq!(summary.processed, 3);
    assert!(summary.failed.is_empty());
    assert_eq!(summary.degraded, 0); // mock model annotated everything
    assert_eq!(summary.rejections.total, 1); // cust_c's bad timestamp
    for id in ["cust_a", "cust_b", "cust_c"] {
        let d = storage.read_decision(id).await.unwrap();
        assert!(d.is_some(), "decision missing for {id}");
    }
}

#[tokio::test]
async fn replaying_the_batch_supersedes_instead_of_duplicating() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let storage: Arc<dyn Storage> = Arc::new(JsonStore::open(dir.path()).unwrap());
    let engine = engine_with_mock();

    batch::run(Arc::clone(&engine), Arc::clone(&storage), None, 2, eval_instant())
        .await
        .unwrap();
    let first = storage.read_decision("cust_a").await.unwrap().unwrap();

    batch::run(engine, Arc::clone(&storage), None, 2, eval_instant())
        .await
        .unwrap();
    let second = storage.read_decision("cust_a").await.unwrap().unwrap();

    // Same evaluation instant, later profile version; ranking unchanged.
    assert_eq!(first.action, second.action);
    assert_eq!(first.ranked, second.ranked);
    assert_eq!(second.profile_version, first.profile_version + 1);

    let files: Vec<_> = std::fs::read_dir(dir.path().join("decisions"))
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(files.len(), 3);
}

#[tokio::test]
async fn mock_enhanced_decisions_blend_confidence() {
    let dir = tempfile::tempdir().unwrap();
    seed(dir.path());
    let storage: Arc<dyn Storage> = Arc::new(JsonStore::open(dir.path()).unwrap());

    batch::run(engine_with_mock(), Arc::clone(&storage), Some(1), 1, eval_instant())
        .await
        .unwrap();

    let d = storage.read_decision("cust_a").await.unwrap().unwrap();
    assert!(!d.degraded);
    for c in &d.ranked {
        assert_eq!(c.llm_confidence, Some(0.9));
        // combined = 0.7 * rule + 0.3 * 0.9
        let expected = 0.7 * c.rule_score + 0.3 * 0.9;
        assert!((c.combined_score - expected).abs() < 1e-5);
    }
}
