use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::state::AppState;

/// Bearer-token gate for the whole admin surface. Every route sits behind
/// it, including health probes: the orchestrator holds iDRAC reach, so
/// nothing is served unauthenticated.
pub async fn require_bearer_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    if let Some(token) = header.and_then(|h| h.strip_prefix("Bearer ")) {
        if token == state.auth_token.as_str() {
            return next.run(request).await;
        }
    }
    (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response()
}
