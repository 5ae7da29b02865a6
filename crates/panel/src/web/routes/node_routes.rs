use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::entities::{node, sync_job};
use crate::db::enums::{NodeStatus, TriggerSource};
use crate::db::services::{self, NewNode, NodeChanges};
use crate::sync::node_client::HEALTH_TIMEOUT;
use crate::sync::NodeClientError;
use crate::web::models::double_option;
use crate::web::{AppError, AppState};

#[derive(Deserialize)]
pub struct CreateNodeRequest {
    name: String,
    api_address: String,
    api_port: i32,
    secret_key: String,
    #[serde(default)]
    public_address: String,
    group_id: Option<i32>,
}

#[derive(Deserialize)]
pub struct UpdateNodeRequest {
    name: Option<String>,
    api_address: Option<String>,
    api_port: Option<i32>,
    secret_key: Option<String>,
    public_address: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    group_id: Option<Option<i32>>,
}

#[derive(Deserialize, Default)]
pub struct DeleteNodeQuery {
    #[serde(default)]
    force: bool,
}

fn validate_port(port: i32) -> Result<(), AppError> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(AppError::BadRequest(format!("api_port {port} out of range")))
    }
}

async fn ensure_group(app_state: &AppState, group_id: Option<i32>) -> Result<(), AppError> {
    if let Some(group_id) = group_id {
        if services::get_group(&app_state.db, group_id).await?.is_none() {
            return Err(AppError::BadRequest(format!("group {group_id} does not exist")));
        }
    }
    Ok(())
}

async fn load_node(app_state: &AppState, node_id: i32) -> Result<node::Model, AppError> {
    services::get_node(&app_state.db, node_id)
        .await?
        .ok_or_else(|| AppError::NotFound("node not found".to_string()))
}

async fn list_nodes_handler(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<node::Model>>, AppError> {
    Ok(Json(services::list_nodes(&app_state.db).await?))
}

async fn create_node_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateNodeRequest>,
) -> Result<(StatusCode, Json<node::Model>), AppError> {
    if payload.name.trim().is_empty() || payload.api_address.trim().is_empty() {
        return Err(AppError::BadRequest("name and api_address are required".to_string()));
    }
    if payload.secret_key.is_empty() {
        return Err(AppError::BadRequest("secret_key is required".to_string()));
    }
    validate_port(payload.api_port)?;
    ensure_group(&app_state, payload.group_id).await?;

    let node = services::create_node(
        &app_state.db,
        NewNode {
            name: payload.name.trim().to_string(),
            api_address: payload.api_address.trim().to_string(),
            api_port: payload.api_port,
            secret_key: payload.secret_key,
            public_address: payload.public_address.trim().to_string(),
            group_id: payload.group_id,
        },
    )
    .await?;
    info!(node_id = node.id, name = %node.name, "Node created.");
    Ok((StatusCode::CREATED, Json(node)))
}

async fn get_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<node::Model>, AppError> {
    Ok(Json(load_node(&app_state, node_id).await?))
}

async fn update_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Json(payload): Json<UpdateNodeRequest>,
) -> Result<Json<node::Model>, AppError> {
    if let Some(port) = payload.api_port {
        validate_port(port)?;
    }
    if let Some(group_id) = payload.group_id {
        ensure_group(&app_state, group_id).await?;
    }
    let before = load_node(&app_state, node_id).await?;

    let node = services::update_node(
        &app_state.db,
        node_id,
        NodeChanges {
            name: payload.name.map(|n| n.trim().to_string()),
            api_address: payload.api_address.map(|a| a.trim().to_string()),
            api_port: payload.api_port,
            secret_key: payload.secret_key,
            public_address: payload.public_address.map(|a| a.trim().to_string()),
            group_id: payload.group_id,
        },
    )
    .await?
    .ok_or_else(|| AppError::NotFound("node not found".to_string()))?;

    // A new group means a new user set on the node.
    if node.group_id.is_some() && node.group_id != before.group_id {
        app_state
            .orchestrator
            .spawn_sync_node(node.id, TriggerSource::AutoGroupMembershipChange);
    }
    Ok(Json(node))
}

/// Plain delete refuses nodes that still own inbounds. `?force=true` first
/// drains the node, then removes its inbounds and the node itself.
async fn delete_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
    Query(query): Query<DeleteNodeQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let node = load_node(&app_state, node_id).await?;
    let inbounds = services::list_inbounds(&app_state.db, Some(node.id)).await?;

    if !query.force && !inbounds.is_empty() {
        return Err(AppError::Conflict(format!(
            "node still has {} inbound(s); delete them or use force=true",
            inbounds.len()
        )));
    }
    if query.force {
        app_state.orchestrator.drain_node(&node).await.map_err(|e| {
            warn!(node_id, error = %e, "Failed to drain node before deletion.");
            AppError::from(e)
        })?;
    }

    let deleted_inbounds = services::delete_node(&app_state.db, node.id).await?;
    info!(node_id, deleted_inbounds, force = query.force, "Node deleted.");
    Ok(Json(serde_json::json!({
        "status": "ok",
        "force": query.force,
        "deleted_inbounds": deleted_inbounds,
    })))
}

async fn node_health_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<serde_json::Value>, AppError> {
    let node = load_node(&app_state, node_id).await?;
    let client = app_state.orchestrator.client();
    let outcome = match tokio::time::timeout(HEALTH_TIMEOUT, client.health(&node)).await {
        Ok(result) => result,
        Err(_) => Err(NodeClientError::Request("health check timed out".to_string())),
    };

    match outcome {
        Ok(()) => {
            let now = Utc::now();
            services::set_node_status(&app_state.db, node.id, NodeStatus::Online, Some(now)).await?;
            Ok(Json(serde_json::json!({ "status": "online", "checked_at": now })))
        }
        Err(e) => {
            services::set_node_status(&app_state.db, node.id, NodeStatus::Offline, None).await?;
            Err(e.into())
        }
    }
}

async fn sync_node_handler(
    State(app_state): State<Arc<AppState>>,
    Path(node_id): Path<i32>,
) -> Result<Json<sync_job::Model>, AppError> {
    let job = app_state
        .orchestrator
        .sync_node_detached(node_id, TriggerSource::ManualSyncNode, None)
        .await?;
    Ok(Json(job))
}

pub fn create_node_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_nodes_handler).post(create_node_handler))
        .route(
            "/{id}",
            get(get_node_handler)
                .put(update_node_handler)
                .delete(delete_node_handler),
        )
        .route("/{id}/health", get(node_health_handler))
        .route("/{id}/sync", post(sync_node_handler))
}
