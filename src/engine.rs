//! Per-customer pipeline orchestration: read → gate → aggregate → profile
//! → rules → enhance → merge, with persistence at the profile/decision
//! edges. Everything up to the enhancement step is pure and CPU-only; the
//! model call is the only network-bound stage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::aggregate::{verify_invariants, ThreadAggregator};
use crate::config::EngineConfig;
use crate::decision::{merge, Decision, MergeWeights};
use crate::enhance::{DynModelClient, Enhancer};
use crate::profile::ProfileBuilder;
use crate::quality::{QualityGate, RejectionStats};
use crate::rules::{RuleContext, RuleEvaluator};
use crate::sentiment::{LexiconScorer, SentimentScorer};
use crate::storage::Storage;

/// Failures the engine surfaces per customer. Configuration-level problems
/// (storage unreachable) travel as `Storage`; everything else is contained
/// at customer granularity.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("customer `{0}` not found")]
    CustomerNotFound(String),
    #[error("internal invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// One prediction's outcome plus gate observability.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub decision: Decision,
    pub rejections: RejectionStats,
}

pub struct Engine {
    cfg: EngineConfig,
    gate: QualityGate,
    aggregator: ThreadAggregator,
    profiles: ProfileBuilder,
    rules: RuleEvaluator,
    enhancer: Enhancer,
}

impl Engine {
    pub fn new(cfg: EngineConfig, model: Option<DynModelClient>) -> Self {
        Self::with_scorer(cfg, model, Arc::new(LexiconScorer::new()))
    }

    pub fn with_scorer(
        cfg: EngineConfig,
        model: Option<DynModelClient>,
        scorer: Arc<dyn SentimentScorer>,
    ) -> Self {
        let engine = Self {
            gate: QualityGate::from_config(&cfg),
            aggregator: ThreadAggregator::from_config(&cfg),
            profiles: ProfileBuilder::new(scorer),
            rules: RuleEvaluator::with_default_rules(),
            enhancer: Enhancer::new(model, &cfg),
            cfg,
        };
        if !engine.enhancer.has_client() {
            // Absence is a startup condition, not a per-call error.
            warn!("no model collaborator configured; decisions will be rule-only");
        }
        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Run the full pipeline for one customer at evaluation instant `now`.
    pub async fn predict(
        &self,
        storage: &dyn Storage,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Prediction, EngineError> {
        let raw = storage.read_records(Some(customer_id), None).await?;
        if raw.is_empty() {
            return Err(EngineError::CustomerNotFound(customer_id.to_string()));
        }

        let (valid, rejections) = self.gate.validate_batch(&raw, now);
        if rejections.total > 0 {
            info!(
                customer_id,
                rejected = rejections.total,
                "records rejected by quality gate"
            );
        }
        if valid.is_empty() {
            // Every record bounced: nothing to decide on.
            return Err(EngineError::CustomerNotFound(customer_id.to_string()));
        }

        let threads = self
            .aggregator
            .aggregate(valid)
            .remove(customer_id)
            .unwrap_or_default();
        if let Err(detail) = verify_invariants(&threads) {
            error!(customer_id, detail = %detail, "thread invariant violated");
            return Err(EngineError::Invariant(detail));
        }

        let version = storage
            .read_profile(customer_id)
            .await?
            .map(|p| p.version + 1)
            .unwrap_or(1);
        let profile = self.profiles.build(customer_id, &threads, version);
        storage.write_profile(&profile).await?;

        // Pure, CPU-only scoring completes before the network-bound step.
        let ctx = RuleContext::new(now, &self.cfg);
        let candidates = self.rules.evaluate(&profile, &ctx);
        let enhanced = self.enhancer.enhance(&profile, candidates).await;

        let decision = merge(
            customer_id,
            enhanced,
            MergeWeights {
                llm_weight: self.cfg.llm_weight,
            },
            profile.version,
            now,
        );
        storage.write_decision(&decision).await?;

        Ok(Prediction {
            decision,
            rejections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enhance::FailingClient;
    use crate::record::RawInteraction;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;

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

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn quick_cfg() -> EngineConfig {
        EngineConfig {
            llm_timeout_secs: 1,
            llm_max_retries: 0,
            llm_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn unknown_customer_is_not_found() {
        let engine = Engine::new(quick_cfg(), None);
        let store = MemoryStore::new();
        let err = engine.predict(&store, "ghost", now()).await.unwrap_err();
        assert!(matches!(err, EngineError::CustomerNotFound(_)));
    }

    #[tokio::test]
    async fn open_issue_yields_reply_decision_and_persists() {
        let engine = Engine::new(quick_cfg(), None);
        let store = MemoryStore::with_records(vec![
            raw("A", "1", "2024-06-01T10:00:00Z", "inbound", "my order is late"),
            raw("A", "2", "2024-06-01T10:05:00Z", "inbound", "anyone there?"),
        ]);
        let p = engine.predict(&store, "A", now()).await.unwrap();
        assert!(p.decision.degraded); // no model collaborator
        assert_ne!(
            p.decision.action,
            crate::decision::ActionType::Monitor,
            "open inbound thread must outrank the monitor floor"
        );
        let stored = store.read_decision("A").await.unwrap().unwrap();
        assert_eq!(stored, p.decision);
        assert_eq!(store.read_profile("A").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn profile_version_increases_across_predictions() {
        let engine = Engine::new(quick_cfg(), None);
        let store = MemoryStore::with_records(vec![raw(
            "A",
            "1",
            "2024-06-01T10:00:00Z",
            "inbound",
            "hello",
        )]);
        engine.predict(&store, "A", now()).await.unwrap();
        engine.predict(&store, "A", now()).await.unwrap();
        assert_eq!(store.read_profile("A").await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn failing_model_still_produces_a_decision() {
        let engine = Engine::new(quick_cfg(), Some(Arc::new(FailingClient)));
        let store = MemoryStore::with_records(vec![raw(
            "A",
            "1",
            "2024-06-01T10:00:00Z",
            "inbound",
            "everything is broken",
        )]);
        let p = engine.predict(&store, "A", now()).await.unwrap();
        assert!(p.decision.degraded);
        assert!(!p.decision.ranked.is_empty());
    }

    #[tokio::test]
    async fn all_records_rejected_reads_as_not_found() {
        let engine = Engine::new(quick_cfg(), None);
        let store = MemoryStore::with_records(vec![raw(
            "A",
            "1",
            "not-a-timestamp",
            "inbound",
            "hello",
        )]);
        let err = engine.predict(&store, "A", now()).await.unwrap_err();
        assert!(matches!(err, EngineError::CustomerNotFound(_)));
    }
}
