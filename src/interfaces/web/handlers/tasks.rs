use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

use super::{ApiError, ApiResult, check_trigger, run_body, synced};
use crate::core::engine::JobKey;
use crate::core::store::TaskStore;
use crate::core::store::types::{NewTask, TaskPatch};
use crate::interfaces::web::AppState;

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

pub async fn list_tasks(State(state): State<AppState>) -> ApiResult {
    let tasks = state.tasks.list().await?;
    Ok(Json(serde_json::json!({ "success": true, "tasks": tasks })))
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(payload): Json<NewTask>,
) -> ApiResult {
    check_trigger(&payload.cron)?;
    let task = state.tasks.create(payload).await?;
    Ok(synced(&state, serde_json::json!({ "task": task })).await)
}

pub async fn get_task(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult {
    let task = state
        .tasks
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task {id}")))?;
    let job_id = JobKey::Db(id).job_id();
    Ok(Json(serde_json::json!({
        "success": true,
        "task": task,
        "job_id": job_id,
        "running": state.engine.guard().is_running(&job_id)
    })))
}

pub async fn update_task(
    Path(id): Path<i64>,
    State(state): State<AppState>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult {
    if let Some(cron) = &patch.cron {
        check_trigger(cron)?;
    }
    let task = state.tasks.update(id, patch).await?;
    Ok(synced(&state, serde_json::json!({ "task": task })).await)
}

pub async fn delete_task(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult {
    if !state.tasks.delete(id).await? {
        return Err(ApiError::not_found(format!("task {id}")));
    }
    Ok(synced(&state, serde_json::json!({ "deleted": id })).await)
}

/// Runs the task now and answers once the run has finished.
pub async fn run_task(Path(id): Path<i64>, State(state): State<AppState>) -> ApiResult {
    let result = state.engine.run_now(&JobKey::Db(id).job_id()).await?;
    run_body(result)
}

pub async fn task_logs(
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(50).min(500);
    let history = state.engine.history(&JobKey::Db(id)).await?;
    let logs = state.tasks.list_logs(id, limit).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "history": history,
        "logs": logs
    })))
}
