use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::db::entities::group;
use crate::db::services;
use crate::web::{AppError, AppState};

#[derive(Deserialize)]
pub struct CreateGroupRequest {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
pub struct UpdateGroupRequest {
    name: Option<String>,
    description: Option<String>,
}

async fn list_groups_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<group::Model>>, AppError> {
    Ok(Json(services::list_groups(&app_state.db).await?))
}

async fn create_group_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<group::Model>), AppError> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("group name is required".to_string()));
    }
    let group = services::create_group(&app_state.db, name, &payload.description).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn get_group_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<i32>,
) -> Result<Json<group::Model>, AppError> {
    services::get_group(&app_state.db, group_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("group not found".to_string()))
}

async fn update_group_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<i32>,
    Json(payload): Json<UpdateGroupRequest>,
) -> Result<Json<group::Model>, AppError> {
    let name = payload.name.map(|n| n.trim().to_string());
    if name.as_deref() == Some("") {
        return Err(AppError::BadRequest("group name is required".to_string()));
    }
    services::update_group(&app_state.db, group_id, name, payload.description)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("group not found".to_string()))
}

async fn delete_group_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<i32>,
) -> Result<Json<serde_json::Value>, AppError> {
    let nodes = services::count_nodes_in_group(&app_state.db, group_id).await?;
    if nodes > 0 {
        return Err(AppError::Conflict(format!(
            "group is still used by {nodes} node(s)"
        )));
    }
    if services::delete_group(&app_state.db, group_id).await? == 0 {
        return Err(AppError::NotFound("group not found".to_string()));
    }
    Ok(Json(serde_json::json!({ "message": "group deleted" })))
}

pub fn create_group_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_groups_handler).post(create_group_handler))
        .route(
            "/{id}",
            get(get_group_handler)
                .put(update_group_handler)
                .delete(delete_group_handler),
        )
}
