//! HTTP surface for the online predictor. One request drives the full
//! per-customer pipeline synchronously; errors come back structured,
//! never as raw internal traces.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::engine::{Engine, EngineError};
use crate::storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub storage: Arc<dyn Storage>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/predict", post(predict))
        .route("/debug/last-decision", get(debug_last_decision))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(serde::Deserialize)]
struct PredictReq {
    customer_id: String,
}

async fn predict(State(state): State<AppState>, Json(body): Json<PredictReq>) -> Response {
    let now = Utc::now();
    match state
        .engine
        .predict(state.storage.as_ref(), &body.customer_id, now)
        .await
    {
        Ok(prediction) => Json(prediction.decision).into_response(),
        Err(err) => error_response(&err),
    }
}

fn error_response(err: &EngineError) -> Response {
    match err {
        EngineError::CustomerNotFound(id) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "customer_not_found", "customer_id": id })),
        )
            .into_response(),
        EngineError::Invariant(_) | EngineError::Storage(_) => {
            tracing::error!(error = %err, "prediction failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "prediction_failed" })),
            )
                .into_response()
        }
    }
}

#[derive(serde::Deserialize)]
struct LastDecisionQuery {
    customer_id: String,
}

async fn debug_last_decision(
    State(state): State<AppState>,
    Query(q): Query<LastDecisionQuery>,
) -> Response {
    match state.storage.read_decision(&q.customer_id).await {
        Ok(Some(decision)) => Json(decision).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no_decision", "customer_id": q.customer_id })),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "reading last decision failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "storage_failed" })),
            )
                .into_response()
        }
    }
}
