//! Batch evaluator: fan out the per-customer pipeline over the stored
//! customer set with bounded concurrency. Customers are independent, so
//! the only coordination is the worker window; one worker runs one
//! customer's pipeline to completion. Per-customer failures are collected,
//! never escalated — only storage-level failures abort the run.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::engine::{Engine, EngineError, Prediction};
use crate::quality::RejectionStats;
use crate::storage::Storage;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("batch_processed_total", "Customers decided in batch runs.");
        describe_counter!("batch_failed_total", "Customers failed in batch runs.");
        describe_counter!("batch_degraded_total", "Batch decisions produced rule-only.");
        describe_gauge!("batch_last_run_ts", "Unix ts when the last batch run finished.");
    });
}

/// End-of-run report: processed / rejected / degraded / failed.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub degraded: usize,
    pub rejections: RejectionStats,
    /// (customer_id, error) pairs; order follows customer order.
    pub failed: Vec<(String, String)>,
}

/// Run the pipeline over up to `limit` customers with `workers` in flight.
/// `workers == 1` degenerates to sequential execution.
pub async fn run(
    engine: Arc<Engine>,
    storage: Arc<dyn Storage>,
    limit: Option<usize>,
    workers: usize,
    now: DateTime<Utc>,
) -> anyhow::Result<BatchSummary> {
    ensure_metrics_described();
    let workers = workers.max(1);
    let customers = storage.list_customers(limit).await?;
    info!(customers = customers.len(), workers, "batch run starting");

    let mut summary = BatchSummary::default();
    let mut results: Vec<(String, Result<Prediction, EngineError>)> =
        Vec::with_capacity(customers.len());

    let mut set: JoinSet<(String, Result<Prediction, EngineError>)> = JoinSet::new();
    for customer_id in customers {
        while set.len() >= workers {
            if let Some(joined) = set.join_next().await {
                results.push(joined.expect("batch worker panicked"));
            }
        }
        let engine = Arc::clone(&engine);
        let storage = Arc::clone(&storage);
        set.spawn(async move {
            let out = engine.predict(storage.as_ref(), &customer_id, now).await;
            (customer_id, out)
        });
    }
    while let Some(joined) = set.join_next().await {
        results.push(joined.expect("batch worker panicked"));
    }

    // Deterministic report order regardless of completion order.
    results.sort_by(|a, b| a.0.cmp(&b.0));
    for (customer_id, outcome) in results {
        match outcome {
            Ok(prediction) => {
                summary.processed += 1;
                summary.rejections.merge(&prediction.rejections);
                if prediction.decision.degraded {
                    summary.degraded += 1;
                    counter!("batch_degraded_total").increment(1);
                }
                counter!("batch_processed_total").increment(1);
            }
            Err(err) => {
                warn!(customer_id, error = %err, "batch entry failed");
                counter!("batch_failed_total").increment(1);
                summary.failed.push((customer_id, err.to_string()));
            }
        }
    }

    gauge!("batch_last_run_ts").set(now.timestamp() as f64);
    info!(
        processed = summary.processed,
        degraded = summary.degraded,
        rejected = summary.rejections.total,
        failed = summary.failed.len(),
        "batch run finished"
    );
    Ok(summary)
}
