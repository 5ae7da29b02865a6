use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::db::services::{self, NodeTrafficSummary, TotalTrafficSummary, TrafficBucket, TrafficPoint, TrafficWindow};
use crate::web::{AppError, AppState};

#[derive(Deserialize, Default)]
pub struct TrafficQuery {
    window: Option<String>,
    bucket: Option<String>,
    node_id: Option<String>,
}

impl TrafficQuery {
    fn since(&self) -> Result<Option<DateTime<Utc>>, AppError> {
        let raw = self.window.as_deref().unwrap_or_default();
        TrafficWindow::parse(raw)
            .map(|window| window.since(Utc::now()))
            .ok_or_else(|| AppError::BadRequest(format!("invalid window: {raw}")))
    }
}

async fn node_summaries_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<TrafficQuery>,
) -> Result<Json<Vec<NodeTrafficSummary>>, AppError> {
    let summaries = services::node_traffic_summaries(&app_state.db, query.since()?).await?;
    Ok(Json(summaries))
}

async fn total_summary_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<TrafficQuery>,
) -> Result<Json<TotalTrafficSummary>, AppError> {
    let summary = services::total_traffic_summary(&app_state.db, query.since()?).await?;
    Ok(Json(summary))
}

async fn timeseries_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<TrafficQuery>,
) -> Result<Json<Vec<TrafficPoint>>, AppError> {
    let since = query.since()?;
    let bucket = match query.bucket.as_deref() {
        None | Some("") => TrafficBucket::Hour,
        Some(raw) => raw.parse::<TrafficBucket>().map_err(AppError::BadRequest)?,
    };
    let node_id = match query.node_id.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<i32>()
                .map_err(|_| AppError::BadRequest(format!("invalid node_id: {raw}")))?,
        ),
    };
    let points = services::traffic_timeseries(&app_state.db, since, bucket, node_id).await?;
    Ok(Json(points))
}

pub fn create_traffic_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/nodes/summary", get(node_summaries_handler))
        .route("/total/summary", get(total_summary_handler))
        .route("/timeseries", get(timeseries_handler))
}
