use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use proxyfleet_common::{InboundTrafficReport, InterfaceSample, SyncPayload};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::{error::NodeError, AppState};
use crate::persist;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn sync_config(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, NodeError> {
    let payload = SyncPayload::parse(&body)?;
    let applied = state.runtime.apply(&payload.inbounds, &body).await?;

    // Already running; a failed write only costs the next warm restart.
    if let Err(e) = persist::persist(&state.state_path, &body).await {
        warn!(
            path = %state.state_path.display(),
            error = %e,
            "Failed to persist applied configuration."
        );
    }

    info!(hash = %applied.hash, inbounds = payload.inbounds.len(), "Config sync accepted.");
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize, Debug, Default)]
pub struct TrafficQuery {
    pub interface: Option<String>,
}

pub async fn interface_traffic(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TrafficQuery>,
) -> Result<Json<InterfaceSample>, NodeError> {
    let interface = query
        .interface
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| state.traffic_interface.clone());
    Ok(Json(state.sampler.sample(&interface).await?))
}

#[derive(Deserialize, Debug, Default)]
pub struct InboundStatsQuery {
    pub reset: Option<String>,
}

pub async fn inbound_traffic(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InboundStatsQuery>,
) -> Json<InboundTrafficReport> {
    let reset = matches!(query.reset.as_deref(), Some("1") | Some("true"));
    Json(InboundTrafficReport {
        data: state.tracker.snapshot(reset),
        reset,
        meta: Some(state.tracker.meta()),
    })
}
