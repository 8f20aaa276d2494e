use axum::{Json, extract::State};

use crate::interfaces::web::AppState;

pub async fn get_schedule(State(state): State<AppState>) -> Json<serde_json::Value> {
    let jobs: Vec<serde_json::Value> = state
        .engine
        .schedule()
        .await
        .into_iter()
        .map(|(job_id, cron)| {
            let running = state.engine.guard().is_running(&job_id);
            serde_json::json!({ "job_id": job_id, "cron": cron, "running": running })
        })
        .collect();

    Json(serde_json::json!({
        "success": true,
        "jobs": jobs,
        "running": state.engine.guard().running()
    }))
}
