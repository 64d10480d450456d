//! Prediction history.

use axum::extract::{Query, State};
use axum::Json;
use dfd_models::PredictionRecord;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListPredictionsQuery {
    pub limit: Option<usize>,
}

/// Stored predictions, newest first.
pub async fn list_predictions(
    State(state): State<AppState>,
    Query(query): Query<ListPredictionsQuery>,
) -> ApiResult<Json<Vec<PredictionRecord>>> {
    let store = state
        .store
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("Prediction history is not enabled"))?;

    if query.limit == Some(0) {
        return Err(ApiError::bad_request("limit must be at least 1"));
    }

    Ok(Json(store.list_recent(query.limit).await?))
}
