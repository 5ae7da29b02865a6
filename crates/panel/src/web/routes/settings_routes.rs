use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::db::entities::system_setting;
use crate::db::services;
use crate::web::{AppError, AppState};

#[derive(Deserialize)]
pub struct UpdateSettingRequest {
    value: String,
}

async fn get_setting_handler(
    State(app_state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<system_setting::Model>, AppError> {
    services::get_setting(&app_state.db, &key)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("setting {key} not found")))
}

async fn update_setting_handler(
    State(app_state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(payload): Json<UpdateSettingRequest>,
) -> Result<Json<system_setting::Model>, AppError> {
    if key.trim().is_empty() {
        return Err(AppError::BadRequest("setting key is required".to_string()));
    }
    let setting = services::upsert_setting(&app_state.db, &key, &payload.value).await?;
    Ok(Json(setting))
}

pub fn create_settings_router() -> Router<Arc<AppState>> {
    Router::new().route("/{key}", get(get_setting_handler).put(update_setting_handler))
}
