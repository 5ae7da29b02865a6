//! Everything between the panel store and a node's `POST /api/config/sync`.

pub mod mask;
pub mod node_client;
pub mod orchestrator;
pub mod payload;

pub use node_client::{HttpNodeClient, NodeApi, NodeClientError};
pub use orchestrator::{RetryPolicy, SyncError, SyncOrchestrator};
pub use payload::{build_node_payload, build_payload, BuildError};
