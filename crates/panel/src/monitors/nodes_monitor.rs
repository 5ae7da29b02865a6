use chrono::Utc;
use dashmap::DashMap;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::MonitorError;
use crate::db::entities::node;
use crate::db::enums::{NodeStatus, TriggerSource};
use crate::db::services;
use crate::sync::node_client::HEALTH_TIMEOUT;
use crate::sync::SyncOrchestrator;

/// Checks every node and keeps the stored status honest.
///
/// A node is flipped offline only after `offline_threshold` consecutive
/// failed health checks. Coming back from offline triggers a ledgered recovery sync.
pub struct NodesMonitor {
    db: DatabaseConnection,
    orchestrator: Arc<SyncOrchestrator>,
    offline_threshold: u32,
    failures: DashMap<i32, u32>,
}

impl NodesMonitor {
    pub fn new(db: DatabaseConnection, orchestrator: Arc<SyncOrchestrator>, offline_threshold: u32) -> Self {
        Self {
            db,
            orchestrator,
            offline_threshold: offline_threshold.max(1),
            failures: DashMap::new(),
        }
    }

    pub async fn start_periodic_check(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        info!(interval_seconds = period.as_secs(), "Nodes monitor started.");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Nodes monitor shutting down.");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_check_cycle(&shutdown).await {
                        error!(error = %e, "Error during node check cycle.");
                    }
                }
            }
        }
    }

    pub async fn run_check_cycle(&self, shutdown: &CancellationToken) -> Result<(), MonitorError> {
        let nodes = services::list_nodes(&self.db).await?;
        debug!(count = nodes.len(), "Checking nodes.");
        for node in nodes {
            if shutdown.is_cancelled() {
                break;
            }
            if !node.has_api() {
                continue;
            }
            if let Err(e) = self.check_node(&node, shutdown).await {
                warn!(node_id = node.id, error = %e, "Node check failed.");
            }
        }
        Ok(())
    }

    async fn check_node(&self, node: &node::Model, shutdown: &CancellationToken) -> Result<(), MonitorError> {
        let client = self.orchestrator.client();
        let healthy = matches!(
            tokio::time::timeout(HEALTH_TIMEOUT, client.health(node)).await,
            Ok(Ok(()))
        );

        if !healthy {
            let failures = {
                let mut count = self.failures.entry(node.id).or_insert(0);
                *count += 1;
                *count
            };
            debug!(node_id = node.id, failures, "Node health check failed.");
            if failures >= self.offline_threshold && node.status == NodeStatus::Online {
                services::set_node_status(&self.db, node.id, NodeStatus::Offline, None).await?;
                warn!(node_id = node.id, name = %node.name, failures, "Node marked offline.");
            }
            return Ok(());
        }

        self.failures.remove(&node.id);
        services::set_node_status(&self.db, node.id, NodeStatus::Online, Some(Utc::now())).await?;
        if node.status == NodeStatus::Offline {
            info!(node_id = node.id, name = %node.name, "Node is back online.");
            if node.group_id.is_some() {
                if let Err(e) = self
                    .orchestrator
                    .sync_node(node.id, TriggerSource::AutoNodeRecovery, None, shutdown)
                    .await
                {
                    warn!(node_id = node.id, error = %e, "Recovery sync failed.");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::sync::orchestrator::tests::{seeded_node, FakeNodeApi};

    async fn setup() -> (DatabaseConnection, Arc<FakeNodeApi>, NodesMonitor, node::Model) {
        let db = test_db().await;
        let node = seeded_node(&db).await;
        let client = Arc::new(FakeNodeApi::scripted(vec![]));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            client.clone(),
            10,
            CancellationToken::new(),
        ));
        let monitor = NodesMonitor::new(db.clone(), orchestrator, 2);
        (db, client, monitor, node)
    }

    async fn status(db: &DatabaseConnection, id: i32) -> NodeStatus {
        services::get_node(db, id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn offline_needs_consecutive_failures() {
        let (db, client, monitor, node) = setup().await;
        let shutdown = CancellationToken::new();

        monitor.run_check_cycle(&shutdown).await.unwrap();
        assert_eq!(status(&db, node.id).await, NodeStatus::Online);

        *client.healthy.lock().unwrap() = false;
        monitor.run_check_cycle(&shutdown).await.unwrap();
        assert_eq!(status(&db, node.id).await, NodeStatus::Online);
        monitor.run_check_cycle(&shutdown).await.unwrap();
        assert_eq!(status(&db, node.id).await, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn a_single_success_resets_the_counter() {
        let (db, client, monitor, node) = setup().await;
        let shutdown = CancellationToken::new();
        monitor.run_check_cycle(&shutdown).await.unwrap();

        *client.healthy.lock().unwrap() = false;
        monitor.run_check_cycle(&shutdown).await.unwrap();
        *client.healthy.lock().unwrap() = true;
        monitor.run_check_cycle(&shutdown).await.unwrap();
        *client.healthy.lock().unwrap() = false;
        monitor.run_check_cycle(&shutdown).await.unwrap();
        assert_eq!(status(&db, node.id).await, NodeStatus::Online);
    }

    #[tokio::test]
    async fn recovery_triggers_a_ledgered_sync() {
        let (db, client, monitor, node) = setup().await;
        let shutdown = CancellationToken::new();
        assert_eq!(node.status, NodeStatus::Offline);

        monitor.run_check_cycle(&shutdown).await.unwrap();
        assert_eq!(status(&db, node.id).await, NodeStatus::Online);
        assert_eq!(client.push_count(), 1);

        let jobs = services::list_sync_jobs(
            &db,
            &services::SyncJobFilter { node_id: Some(node.id), limit: 10, ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].trigger_source, TriggerSource::AutoNodeRecovery);

        // Already online: no further syncs.
        monitor.run_check_cycle(&shutdown).await.unwrap();
        assert_eq!(client.push_count(), 1);
    }
}
