use axum::{
    body::Body as AxumBody,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::services::auth_service;
use crate::web::models::AuthenticatedAdmin;
use crate::web::{error::AppError, AppState};

pub async fn auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<AxumBody>,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("unauthorized".to_string()))?;

    let claims = auth_service::decode_token(token, &state.config.jwt_secret)?;
    req.extensions_mut().insert(AuthenticatedAdmin {
        id: claims.admin_id,
        username: claims.sub,
    });
    Ok(next.run(req).await)
}
