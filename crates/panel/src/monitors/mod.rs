//! Background loops owned by the panel process.

pub mod nodes_monitor;
pub mod traffic_monitor;

pub use nodes_monitor::NodesMonitor;
pub use traffic_monitor::TrafficMonitor;

use sea_orm::DbErr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
    #[error(transparent)]
    Node(#[from] crate::sync::NodeClientError),
}
