use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use std::sync::Arc;

use crate::db::services;
use crate::services::subscription_service;
use crate::web::{AppError, AppState};

async fn subscription_handler(
    State(app_state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let not_found = || AppError::NotFound("subscription not found".to_string());
    let user = services::get_user_by_uuid(&app_state.db, &uuid)
        .await?
        .ok_or_else(not_found)?;
    if !user.is_active(chrono::Utc::now()) {
        return Err(not_found());
    }
    let body = subscription_service::render_subscription(&app_state.db, &user).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body))
}

pub fn create_subscription_router() -> Router<Arc<AppState>> {
    Router::new().route("/{uuid}", get(subscription_handler))
}
