use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::db::entities::{sync_attempt, sync_job};
use crate::db::enums::{SyncJobStatus, TriggerSource};
use crate::db::services::{self, SyncJobFilter};
use crate::web::{AppError, AppState};

const DEFAULT_LIMIT: u64 = 50;
const MAX_LIMIT: u64 = 500;

// Raw strings so malformed values answer with the usual JSON error body.
#[derive(Deserialize, Default)]
pub struct SyncJobQuery {
    node_id: Option<String>,
    status: Option<String>,
    trigger_source: Option<String>,
    from: Option<String>,
    to: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

#[derive(Serialize)]
pub struct SyncJobDetail {
    job: sync_job::Model,
    attempts: Vec<sync_attempt::Model>,
}

fn parse_opt<T: FromStr>(name: &str, raw: Option<&str>) -> Result<Option<T>, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::BadRequest(format!("invalid {name}: {value}"))),
    }
}

fn parse_time(name: &str, raw: Option<&str>) -> Result<Option<DateTime<Utc>>, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(|at| Some(at.with_timezone(&Utc)))
            .map_err(|_| AppError::BadRequest(format!("invalid {name}: expected RFC3339"))),
    }
}

impl TryFrom<SyncJobQuery> for SyncJobFilter {
    type Error = AppError;

    fn try_from(query: SyncJobQuery) -> Result<Self, AppError> {
        let limit = parse_opt::<i64>("limit", query.limit.as_deref())?;
        let offset = parse_opt::<i64>("offset", query.offset.as_deref())?;
        let limit = match limit {
            None => DEFAULT_LIMIT,
            Some(n) if (1..=MAX_LIMIT as i64).contains(&n) => n as u64,
            Some(n) => {
                return Err(AppError::BadRequest(format!(
                    "limit must be between 1 and {MAX_LIMIT}, got {n}"
                )))
            }
        };
        let offset = match offset {
            None => 0,
            Some(n) if n >= 0 => n as u64,
            Some(n) => return Err(AppError::BadRequest(format!("offset must not be negative, got {n}"))),
        };

        Ok(SyncJobFilter {
            node_id: parse_opt::<i32>("node_id", query.node_id.as_deref())?,
            status: parse_opt::<SyncJobStatus>("status", query.status.as_deref())?,
            trigger_source: parse_opt::<TriggerSource>("trigger_source", query.trigger_source.as_deref())?,
            from: parse_time("from", query.from.as_deref())?,
            to: parse_time("to", query.to.as_deref())?,
            limit,
            offset,
        })
    }
}

async fn list_sync_jobs_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<SyncJobQuery>,
) -> Result<Json<Vec<sync_job::Model>>, AppError> {
    let filter = SyncJobFilter::try_from(query)?;
    let jobs = services::list_sync_jobs(&app_state.db, &filter).await?;
    Ok(Json(jobs))
}

async fn get_sync_job_handler(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<i32>,
) -> Result<Json<SyncJobDetail>, AppError> {
    let job = services::get_sync_job(&app_state.db, job_id)
        .await?
        .ok_or_else(|| AppError::NotFound("sync job not found".to_string()))?;
    let attempts = services::list_sync_attempts(&app_state.db, job_id).await?;
    Ok(Json(SyncJobDetail { job, attempts }))
}

async fn retry_sync_job_handler(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<i32>,
) -> Result<Json<sync_job::Model>, AppError> {
    let job = app_state.orchestrator.retry_job_detached(job_id).await?;
    Ok(Json(job))
}

pub fn create_sync_job_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_sync_jobs_handler))
        .route("/{id}", get(get_sync_job_handler))
        .route("/{id}/retry", post(retry_sync_job_handler))
}
