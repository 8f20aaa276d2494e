use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

use super::{ApiError, ApiResult, check_trigger, run_body, synced};
use crate::core::engine::JobKey;
use crate::core::store::SignTaskStore;
use crate::core::store::types::{SignTaskDraft, SignTaskPatch};
use crate::interfaces::web::AppState;

/// Picks one account when the same task name exists under several.
#[derive(Deserialize, Default)]
pub struct AccountQuery {
    pub account: Option<String>,
}

fn job_id(name: &str) -> String {
    JobKey::Sign(name.to_string()).job_id()
}

pub async fn list_sign_tasks(State(state): State<AppState>) -> ApiResult {
    let tasks = state.signs.list(false).await?;
    let tasks: Vec<serde_json::Value> = tasks
        .into_iter()
        .map(|task| {
            let running = state.engine.guard().is_running(&job_id(&task.name));
            let mut value = serde_json::to_value(&task).unwrap_or_default();
            if let serde_json::Value::Object(map) = &mut value {
                map.insert("running".to_string(), running.into());
            }
            value
        })
        .collect();
    Ok(Json(serde_json::json!({ "success": true, "tasks": tasks })))
}

pub async fn create_sign_task(
    State(state): State<AppState>,
    Json(draft): Json<SignTaskDraft>,
) -> ApiResult {
    check_trigger(&draft.sign_at)?;
    let task = state.signs.create(draft).await?;
    Ok(synced(&state, serde_json::json!({ "task": task })).await)
}

pub async fn get_sign_task(
    Path(name): Path<String>,
    Query(query): Query<AccountQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    let task = state
        .signs
        .get(&name, query.account.as_deref())
        .await?
        .ok_or_else(|| ApiError::not_found(format!("sign task {name}")))?;
    Ok(Json(serde_json::json!({
        "success": true,
        "task": task,
        "job_id": job_id(&name),
        "running": state.engine.guard().is_running(&job_id(&name))
    })))
}

pub async fn update_sign_task(
    Path(name): Path<String>,
    Query(query): Query<AccountQuery>,
    State(state): State<AppState>,
    Json(patch): Json<SignTaskPatch>,
) -> ApiResult {
    if let Some(sign_at) = &patch.sign_at {
        check_trigger(sign_at)?;
    }
    let task = state
        .signs
        .update(&name, query.account.as_deref(), patch)
        .await?;
    Ok(synced(&state, serde_json::json!({ "task": task })).await)
}

pub async fn delete_sign_task(
    Path(name): Path<String>,
    Query(query): Query<AccountQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    if !state
        .signs
        .delete(&name, query.account.as_deref())
        .await?
    {
        return Err(ApiError::not_found(format!("sign task {name}")));
    }
    Ok(synced(&state, serde_json::json!({ "deleted": name })).await)
}

/// Runs the task now and answers once the run has finished.
pub async fn run_sign_task(Path(name): Path<String>, State(state): State<AppState>) -> ApiResult {
    let result = state.engine.run_now(&job_id(&name)).await?;
    run_body(result)
}

pub async fn sign_task_history(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    let history = state
        .engine
        .history(&JobKey::Sign(name.clone()))
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "history": history })))
}

/// Everything currently buffered for the task's live output.
pub async fn sign_task_live(
    Path(name): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let snapshot = state.engine.guard().snapshot(&job_id(&name), 0);
    Json(serde_json::json!({ "success": true, "live": snapshot }))
}
