use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use super::{error::NodeError, AppState};

/// Requires `Authorization: Bearer <secret key>`.
pub async fn auth(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, NodeError> {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.secret_key);

    if !authorized {
        warn!(path = %req.uri().path(), "Rejected request with missing or wrong bearer token.");
        return Err(NodeError::Unauthorized);
    }
    Ok(next.run(req).await)
}
