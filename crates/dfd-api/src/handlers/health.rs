//! Health check handlers.

use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use dfd_inference::WeightsStatus;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct RootResponse {
    pub message: String,
    pub status: String,
}

/// Root health check.
pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "DeepFake Detection API is running".to_string(),
        status: "OK".to_string(),
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Liveness probe.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Readiness check response.
#[derive(Serialize)]
pub struct ReadinessResponse {
    /// `ready`, `degraded` (fallback weights in use) or `unavailable`
    pub status: String,
    pub models: WeightsStatus,
    pub persistence: CheckStatus,
}

#[derive(Serialize)]
pub struct CheckStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

/// Readiness probe.
///
/// Models load lazily, so unloaded components do not fail the probe; an
/// unreachable prediction store does.
pub async fn ready(
    State(state): State<AppState>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    let persistence = match &state.store {
        None => CheckStatus {
            status: "disabled".to_string(),
            backend: None,
            error: None,
            latency_ms: None,
        },
        Some(store) => {
            let start = Instant::now();
            let result = store.ping().await;
            CheckStatus {
                status: if result.is_ok() { "ok" } else { "error" }.to_string(),
                backend: Some(store.backend().to_string()),
                error: result.err().map(|e| e.to_string()),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            }
        }
    };

    let models = state.classifier.weights_status();
    let store_ok = persistence.status != "error";
    let status = if !store_ok {
        "unavailable"
    } else if models.degraded() {
        "degraded"
    } else {
        "ready"
    };

    let response = ReadinessResponse {
        status: status.to_string(),
        models,
        persistence,
    };

    if store_ok {
        Ok(Json(response))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(response)))
    }
}
