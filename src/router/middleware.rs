//! Authentication middleware

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use super::AppState;

/// Require the shared agent secret on every request.
///
/// `OPTIONS` preflights and the liveness probe are exempt. A host with no
/// stored secret rejects everything else; that is the fail-closed default
/// until registration completes.
pub async fn require_secret(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS || request.uri().path() == "/ping" {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(state.config.remote.header_name.as_str())
        .and_then(|h| h.to_str().ok());

    let expected = match state.secrets.get_agent_secret() {
        Ok(secret) => secret,
        Err(e) => {
            warn!("Keystore unavailable during auth check: {}", e);
            None
        }
    };

    match (provided, expected) {
        (Some(provided), Some(expected)) if provided == expected => next.run(request).await,
        _ => unauthorized_response(),
    }
}

fn unauthorized_response() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "ok": false,
            "error": "Unauthorized",
        })),
    )
        .into_response()
}
