use axum::{extract::State, routing::post, Json, Router};
use std::sync::Arc;

use crate::services::auth_service;
use crate::web::models::{LoginRequest, LoginResponse, SetupRequest};
use crate::web::{AppError, AppState};

async fn login_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let response = auth_service::login(&app_state.db, payload, &app_state.config.jwt_secret).await?;
    Ok(Json(response))
}

async fn setup_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<SetupRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let response = auth_service::setup_admin(
        &app_state.db,
        payload,
        app_state.config.setup_token.as_deref(),
        &app_state.config.jwt_secret,
    )
    .await?;
    Ok(Json(response))
}

pub fn create_auth_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/login", post(login_handler))
        .route("/setup", post(setup_handler))
}
