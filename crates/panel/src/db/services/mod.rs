//! Data access for the panel store, one module per area, re-exported flat.

pub mod admin_service;
pub mod group_service;
pub mod inbound_service;
pub mod node_service;
pub mod settings_service;
pub mod sync_job_service;
pub mod traffic_service;
pub mod user_service;

pub use admin_service::*;
pub use group_service::*;
pub use inbound_service::*;
pub use node_service::*;
pub use settings_service::*;
pub use sync_job_service::*;
pub use traffic_service::*;
pub use user_service::*;
