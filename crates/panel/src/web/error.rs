use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::{DbErr, SqlErr};
use thiserror::Error;
use tracing::error;

use crate::sync::{NodeClientError, SyncError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("Database error: {0}")]
    Database(DbErr),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Database(e) => {
                error!(error = %e, "Database error while handling request.");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            AppError::Internal(msg) => {
                error!(error = %msg, "Internal error while handling request.");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DbErr> for AppError {
    fn from(err: DbErr) -> Self {
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => {
                AppError::Conflict("resource already exists".to_string())
            }
            Some(SqlErr::ForeignKeyConstraintViolation(_)) => {
                AppError::Conflict("resource is still referenced".to_string())
            }
            _ => AppError::Database(err),
        }
    }
}

impl From<NodeClientError> for AppError {
    fn from(err: NodeClientError) -> Self {
        AppError::BadGateway(err.to_string())
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NodeNotFound(_) => AppError::NotFound("node not found".to_string()),
            SyncError::JobNotFound(_) => AppError::NotFound("sync job not found".to_string()),
            SyncError::NoGroup(_) => AppError::BadRequest("node has no group".to_string()),
            SyncError::Build(e) => AppError::BadRequest(e.to_string()),
            SyncError::Upstream { error, .. } => AppError::BadGateway(error.to_string()),
            SyncError::Cancelled { .. } => AppError::BadGateway("node sync cancelled".to_string()),
            SyncError::Task(msg) => AppError::Internal(msg),
            SyncError::Db(e) => e.into(),
        }
    }
}
