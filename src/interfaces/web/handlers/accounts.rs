use axum::{
    Json,
    extract::{Path, State},
};
use serde::Deserialize;

use super::{ApiError, ApiResult, synced};
use crate::interfaces::web::AppState;

#[derive(Deserialize)]
pub struct CreateAccountRequest {
    pub account_name: String,
}

pub async fn list_accounts(State(state): State<AppState>) -> ApiResult {
    let accounts = state.tasks.list_accounts().await?;
    Ok(Json(serde_json::json!({ "success": true, "accounts": accounts })))
}

pub async fn create_account(
    State(state): State<AppState>,
    Json(payload): Json<CreateAccountRequest>,
) -> ApiResult {
    let name = payload.account_name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("account_name is required"));
    }
    let account = state.tasks.create_account(name).await?;
    Ok(synced(&state, serde_json::json!({ "account": account })).await)
}

/// Sign-task runs of one account across all of its tasks, newest first.
pub async fn account_history(
    Path(account): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let history = state.sign_history.account_history(&account).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "account": account,
        "history": history
    })))
}
