use axum::{http::Method, middleware as axum_middleware, routing::get, Router};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::PanelConfig;
use crate::sync::SyncOrchestrator;
use crate::web::{middleware::auth, routes::*};

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;

pub use error::AppError;

pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<PanelConfig>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

async fn health_check_handler() -> &'static str {
    "OK"
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let protected = Router::new()
        .nest("/users", user_routes::create_user_router())
        .nest("/groups", group_routes::create_group_router())
        .nest("/nodes", node_routes::create_node_router())
        .nest("/inbounds", inbound_routes::create_inbound_router())
        .nest("/sync-jobs", sync_job_routes::create_sync_job_router())
        .nest("/traffic", traffic_routes::create_traffic_router())
        .nest("/settings", settings_routes::create_settings_router())
        .route_layer(axum_middleware::from_fn_with_state(app_state.clone(), auth::auth));

    Router::new()
        .route("/api/health", get(health_check_handler))
        .nest("/api/auth", auth_routes::create_auth_router())
        .nest("/api", protected)
        .nest("/sub", subscription_routes::create_subscription_router())
        .layer(cors)
        .with_state(app_state)
}
