use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

use super::{ApiResult, synced};
use crate::interfaces::web::AppState;

#[derive(Deserialize, Default)]
pub struct ImportQuery {
    #[serde(default)]
    pub overwrite: bool,
}

pub async fn export_all(State(state): State<AppState>) -> ApiResult {
    Ok(Json(state.signs.export_all().await?))
}

pub async fn export_task(Path(name): Path<String>, State(state): State<AppState>) -> ApiResult {
    let export = state.signs.export(&name).await?;
    Ok(Json(serde_json::to_value(export).map_err(crate::core::error::EngineError::from)?))
}

/// Accepts the output of either export endpoint.
pub async fn import(
    Query(query): Query<ImportQuery>,
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult {
    let report = state.signs.import(&payload, query.overwrite).await?;
    Ok(synced(&state, serde_json::json!({ "report": report })).await)
}
