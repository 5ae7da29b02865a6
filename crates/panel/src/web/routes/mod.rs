pub mod auth_routes;
pub mod group_routes;
pub mod inbound_routes;
pub mod node_routes;
pub mod settings_routes;
pub mod subscription_routes;
pub mod sync_job_routes;
pub mod traffic_routes;
pub mod user_routes;
