use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;

use super::AppState;
use crate::core::config::is_loopback_host;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Denied {
    NoTokensConfigured,
    MissingToken,
    InvalidToken,
}

impl Denied {
    pub(crate) fn message(self) -> &'static str {
        match self {
            Denied::NoTokensConfigured => {
                "No API tokens configured. Create one with `signdeck token create` before exposing on a non-loopback address."
            }
            Denied::MissingToken => "Missing or invalid Authorization header. Use: Bearer <token>",
            Denied::InvalidToken => "Invalid or unauthorized API token",
        }
    }
}

/// Open access only while no token exists and the server is bound to
/// loopback; otherwise `token` has to match a stored hash.
pub(crate) async fn authorize(state: &AppState, token: Option<&str>) -> Result<(), Denied> {
    let no_tokens = match state.tokens.is_empty().await {
        Ok(empty) => empty,
        Err(e) => {
            warn!("Token lookup failed: {}", e);
            false
        }
    };

    if no_tokens {
        if is_loopback_host(&state.api_host) {
            return Ok(());
        }
        return Err(Denied::NoTokensConfigured);
    }

    let token = token.ok_or(Denied::MissingToken)?;
    if state.tokens.verify(token).await.unwrap_or(false) {
        Ok(())
    } else {
        Err(Denied::InvalidToken)
    }
}

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let raw_token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string());

    match authorize(&state, raw_token.as_deref()).await {
        Ok(()) => next.run(req).await,
        Err(denied) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "success": false, "error": denied.message() })),
        )
            .into_response(),
    }
}
