use axum::{
    Json, Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{accounts, config, live_logs, schedule, sign_tasks, tasks};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub fn build_api_router(state: AppState) -> Router {
    // The live log socket checks its `?token=` itself so it can close with
    // a policy-violation frame instead of a plain 401.
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/api/ws/runs/{job_id}", get(live_logs::run_logs_ws))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route(
            "/api/accounts",
            get(accounts::list_accounts).post(accounts::create_account),
        )
        .route(
            "/api/accounts/{account}/history",
            get(accounts::account_history),
        )
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route(
            "/api/tasks/{id}",
            get(tasks::get_task)
                .put(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route("/api/tasks/{id}/run", post(tasks::run_task))
        .route("/api/tasks/{id}/logs", get(tasks::task_logs))
        .route(
            "/api/sign-tasks",
            get(sign_tasks::list_sign_tasks).post(sign_tasks::create_sign_task),
        )
        .route(
            "/api/sign-tasks/{name}",
            get(sign_tasks::get_sign_task)
                .put(sign_tasks::update_sign_task)
                .delete(sign_tasks::delete_sign_task),
        )
        .route("/api/sign-tasks/{name}/run", post(sign_tasks::run_sign_task))
        .route(
            "/api/sign-tasks/{name}/history",
            get(sign_tasks::sign_task_history),
        )
        .route("/api/sign-tasks/{name}/live", get(sign_tasks::sign_task_live))
        .route("/api/config/export", get(config::export_all))
        .route("/api/config/export/{name}", get(config::export_task))
        .route("/api/config/import", post(config::import))
        .route("/api/schedule", get(schedule::get_schedule))
        .route("/api/events/runs", get(super::sse_runs_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state);

    public_routes.merge(authed_routes)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'"),
    );
    response
}
