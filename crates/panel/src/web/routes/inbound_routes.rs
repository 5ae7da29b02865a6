use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::db::entities::{inbound, node};
use crate::db::enums::TriggerSource;
use crate::db::services::{self, InboundChanges, NewInbound};
use crate::sync::payload::SUPPORTED_PROTOCOLS;
use crate::web::models::double_option;
use crate::web::{AppError, AppState};

#[derive(Deserialize)]
pub struct CreateInboundRequest {
    node_id: i32,
    tag: String,
    protocol: String,
    listen_port: i32,
    #[serde(default)]
    public_port: i32,
    #[serde(default = "empty_object")]
    settings: Value,
    tls_settings: Option<Value>,
    transport_settings: Option<Value>,
}

#[derive(Deserialize)]
pub struct UpdateInboundRequest {
    tag: Option<String>,
    protocol: Option<String>,
    listen_port: Option<i32>,
    public_port: Option<i32>,
    settings: Option<Value>,
    #[serde(default, deserialize_with = "double_option")]
    tls_settings: Option<Option<Value>>,
    #[serde(default, deserialize_with = "double_option")]
    transport_settings: Option<Option<Value>>,
}

#[derive(Deserialize, Default)]
pub struct ListInboundsQuery {
    node_id: Option<i32>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn validate_tag(tag: &str) -> Result<String, AppError> {
    let tag = tag.trim();
    if tag.is_empty() {
        return Err(AppError::BadRequest("tag is required".to_string()));
    }
    Ok(tag.to_string())
}

fn validate_protocol(protocol: &str) -> Result<String, AppError> {
    let protocol = protocol.trim().to_ascii_lowercase();
    if !SUPPORTED_PROTOCOLS.contains(&protocol.as_str()) {
        return Err(AppError::BadRequest(format!("unsupported protocol: {protocol}")));
    }
    Ok(protocol)
}

fn validate_ports(listen_port: Option<i32>, public_port: Option<i32>) -> Result<(), AppError> {
    if listen_port.is_some_and(|p| !(1..=65535).contains(&p)) {
        return Err(AppError::BadRequest("listen_port must be between 1 and 65535".to_string()));
    }
    if public_port.is_some_and(|p| !(0..=65535).contains(&p)) {
        return Err(AppError::BadRequest("public_port must be between 0 and 65535".to_string()));
    }
    Ok(())
}

fn validate_object(field: &str, value: Option<&Value>) -> Result<(), AppError> {
    match value {
        Some(v) if !v.is_object() => Err(AppError::BadRequest(format!("{field} must be a JSON object"))),
        _ => Ok(()),
    }
}

async fn ensure_tag_free(
    app_state: &AppState,
    node_id: i32,
    tag: &str,
    own_id: Option<i32>,
) -> Result<(), AppError> {
    match services::find_inbound_by_tag(&app_state.db, node_id, tag).await? {
        Some(existing) if Some(existing.id) != own_id => Err(AppError::Conflict(format!(
            "inbound tag {tag} already exists on node {node_id}"
        ))),
        _ => Ok(()),
    }
}

/// Pushes the node's new configuration when it can receive one.
fn resync(app_state: &AppState, node: &node::Model) {
    if node.group_id.is_some() {
        app_state
            .orchestrator
            .spawn_sync_node(node.id, TriggerSource::AutoInboundChange);
    }
}

async fn load_inbound(app_state: &AppState, inbound_id: i32) -> Result<inbound::Model, AppError> {
    services::get_inbound(&app_state.db, inbound_id)
        .await?
        .ok_or_else(|| AppError::NotFound("inbound not found".to_string()))
}

async fn load_node(app_state: &AppState, node_id: i32) -> Result<node::Model, AppError> {
    services::get_node(&app_state.db, node_id)
        .await?
        .ok_or_else(|| AppError::NotFound("node not found".to_string()))
}

async fn list_inbounds_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<ListInboundsQuery>,
) -> Result<Json<Vec<inbound::Model>>, AppError> {
    Ok(Json(services::list_inbounds(&app_state.db, query.node_id).await?))
}

async fn create_inbound_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateInboundRequest>,
) -> Result<(StatusCode, Json<inbound::Model>), AppError> {
    let tag = validate_tag(&payload.tag)?;
    let protocol = validate_protocol(&payload.protocol)?;
    validate_ports(Some(payload.listen_port), Some(payload.public_port))?;
    validate_object("settings", Some(&payload.settings))?;
    validate_object("tls_settings", payload.tls_settings.as_ref())?;
    validate_object("transport_settings", payload.transport_settings.as_ref())?;

    let node = services::get_node(&app_state.db, payload.node_id)
        .await?
        .ok_or_else(|| AppError::BadRequest(format!("node {} does not exist", payload.node_id)))?;
    ensure_tag_free(&app_state, node.id, &tag, None).await?;

    let inbound = services::create_inbound(
        &app_state.db,
        NewInbound {
            node_id: node.id,
            tag,
            protocol,
            listen_port: payload.listen_port,
            public_port: payload.public_port,
            settings: payload.settings,
            tls_settings: payload.tls_settings,
            transport_settings: payload.transport_settings,
        },
    )
    .await?;
    info!(inbound_id = inbound.id, node_id = node.id, tag = %inbound.tag, "Inbound created.");
    resync(&app_state, &node);
    Ok((StatusCode::CREATED, Json(inbound)))
}

async fn get_inbound_handler(
    State(app_state): State<Arc<AppState>>,
    Path(inbound_id): Path<i32>,
) -> Result<Json<inbound::Model>, AppError> {
    Ok(Json(load_inbound(&app_state, inbound_id).await?))
}

async fn update_inbound_handler(
    State(app_state): State<Arc<AppState>>,
    Path(inbound_id): Path<i32>,
    Json(payload): Json<UpdateInboundRequest>,
) -> Result<Json<inbound::Model>, AppError> {
    let tag = payload.tag.as_deref().map(validate_tag).transpose()?;
    let protocol = payload.protocol.as_deref().map(validate_protocol).transpose()?;
    validate_ports(payload.listen_port, payload.public_port)?;
    validate_object("settings", payload.settings.as_ref())?;
    validate_object("tls_settings", payload.tls_settings.as_ref().and_then(Option::as_ref))?;
    validate_object(
        "transport_settings",
        payload.transport_settings.as_ref().and_then(Option::as_ref),
    )?;

    let existing = load_inbound(&app_state, inbound_id).await?;
    if let Some(tag) = &tag {
        ensure_tag_free(&app_state, existing.node_id, tag, Some(existing.id)).await?;
    }

    let inbound = services::update_inbound(
        &app_state.db,
        inbound_id,
        InboundChanges {
            tag,
            protocol,
            listen_port: payload.listen_port,
            public_port: payload.public_port,
            settings: payload.settings,
            tls_settings: payload.tls_settings,
            transport_settings: payload.transport_settings,
        },
    )
    .await?
    .ok_or_else(|| AppError::NotFound("inbound not found".to_string()))?;

    let node = load_node(&app_state, inbound.node_id).await?;
    resync(&app_state, &node);
    Ok(Json(inbound))
}

async fn delete_inbound_handler(
    State(app_state): State<Arc<AppState>>,
    Path(inbound_id): Path<i32>,
) -> Result<Json<Value>, AppError> {
    let inbound = load_inbound(&app_state, inbound_id).await?;
    services::delete_inbound(&app_state.db, inbound.id).await?;
    info!(inbound_id, node_id = inbound.node_id, tag = %inbound.tag, "Inbound deleted.");

    if let Some(node) = services::get_node(&app_state.db, inbound.node_id).await? {
        resync(&app_state, &node);
    }
    Ok(Json(serde_json::json!({ "message": "inbound deleted" })))
}

pub fn create_inbound_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_inbounds_handler).post(create_inbound_handler))
        .route(
            "/{id}",
            get(get_inbound_handler)
                .put(update_inbound_handler)
                .delete(delete_inbound_handler),
        )
}
