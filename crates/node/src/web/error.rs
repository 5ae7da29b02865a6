use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use proxyfleet_common::PayloadError;
use thiserror::Error;

use crate::engine::EngineError;
use crate::sampler::SamplerError;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("unauthorized")]
    Unauthorized,
    #[error(transparent)]
    InvalidPayload(#[from] PayloadError),
    #[error(transparent)]
    Apply(#[from] EngineError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        match self {
            NodeError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "unauthorized" })),
            )
                .into_response(),
            NodeError::InvalidPayload(e) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response(),
            // The panel ledgers this body verbatim, so it stays plain text.
            NodeError::Apply(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
            NodeError::Sampler(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response(),
        }
    }
}
