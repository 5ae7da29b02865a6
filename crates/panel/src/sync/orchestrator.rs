//! Serialized, retried and ledgered configuration pushes.

use chrono::Utc;
use dashmap::DashMap;
use proxyfleet_common::SyncPayload;
use sea_orm::{DatabaseConnection, DbErr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::mask::mask_secrets;
use super::node_client::{NodeApi, NodeClientError};
use super::payload::{build_node_payload, BuildError};
use crate::db::entities::{node, sync_job};
use crate::db::enums::{NodeStatus, SyncAttemptStatus, SyncJobStatus, TriggerSource};
use crate::db::services::{self, AttemptOutcome, JobOutcome, NewSyncJob};

pub const NOOP_NOTE: &str = "no-op: payload unchanged";
const MAX_ERROR_SUMMARY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Sleep after failed attempt `attempt` (1-based), before the next one.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("node {0} not found")]
    NodeNotFound(i32),
    #[error("sync job {0} not found")]
    JobNotFound(i32),
    #[error("node {0} has no group")]
    NoGroup(i32),
    #[error(transparent)]
    Build(BuildError),
    /// Every attempt failed; the job row is already terminal.
    #[error("{error}")]
    Upstream {
        job: Box<sync_job::Model>,
        error: NodeClientError,
    },
    #[error("node sync cancelled")]
    Cancelled { job: Box<sync_job::Model> },
    #[error("sync task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Db(#[from] DbErr),
}

impl From<BuildError> for SyncError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::NoGroup(id) => SyncError::NoGroup(id),
            BuildError::Db(e) => SyncError::Db(e),
            other => SyncError::Build(other),
        }
    }
}

/// Trims to the ledger column size on a char boundary.
pub fn error_summary(message: &str) -> String {
    let message = message.trim();
    if message.is_empty() {
        return "sync failed".to_string();
    }
    match message.char_indices().nth(MAX_ERROR_SUMMARY) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

pub struct SyncOrchestrator {
    db: DatabaseConnection,
    client: Arc<dyn NodeApi>,
    locks: DashMap<i32, Arc<Mutex<()>>>,
    policy: RetryPolicy,
    keep_jobs: u64,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        db: DatabaseConnection,
        client: Arc<dyn NodeApi>,
        keep_jobs: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            db,
            client,
            locks: DashMap::new(),
            policy: RetryPolicy::default(),
            keep_jobs: keep_jobs.max(1),
            shutdown,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn client(&self) -> &Arc<dyn NodeApi> {
        &self.client
    }

    fn node_lock(&self, node_id: i32) -> Arc<Mutex<()>> {
        self.locks
            .entry(node_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Builds, ledgers and pushes the node's configuration.
    ///
    /// Returns the terminal job on success. Build errors fail before any
    /// ledger row exists; push failures are ledgered first and come back as
    /// [`SyncError::Upstream`] or [`SyncError::Cancelled`].
    pub async fn sync_node(
        &self,
        node_id: i32,
        trigger: TriggerSource,
        parent_job_id: Option<i32>,
        cancel: &CancellationToken,
    ) -> Result<sync_job::Model, SyncError> {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock().await;

        let node = services::get_node(&self.db, node_id)
            .await?
            .ok_or(SyncError::NodeNotFound(node_id))?;
        if node.group_id.is_none() {
            return Err(SyncError::NoGroup(node_id));
        }
        let payload = build_node_payload(&self.db, &node).await?;
        let hash = payload.payload_hash();
        let digest = payload.config_digest();
        if tracing::enabled!(tracing::Level::DEBUG) {
            let masked = serde_json::to_value(&payload)
                .map(|v| mask_secrets(&v))
                .unwrap_or_default();
            debug!(node_id, payload = %masked, "Built sync payload.");
        }

        let previous_digest = services::last_success_digest(&self.db, node_id).await?;
        let job = services::create_sync_job(
            &self.db,
            NewSyncJob {
                node_id,
                parent_job_id,
                trigger_source: trigger,
                payload_hash: hash,
                config_digest: digest.clone(),
                inbound_count: payload.inbounds.len() as i32,
                active_user_count: payload.active_user_count() as i32,
            },
        )
        .await?;
        let job = services::mark_sync_job_running(&self.db, job, Utc::now()).await?;

        let unchanged = previous_digest.as_deref() == Some(digest.as_str());
        if trigger.is_dedupable() && node.status == NodeStatus::Online && unchanged {
            return self.finish_noop(job).await;
        }

        self.push_with_retry(job, node, payload, cancel).await
    }

    /// Re-runs a previous job as a child of it.
    pub async fn retry_job(
        &self,
        job_id: i32,
        cancel: &CancellationToken,
    ) -> Result<sync_job::Model, SyncError> {
        let original = services::get_sync_job(&self.db, job_id)
            .await?
            .ok_or(SyncError::JobNotFound(job_id))?;
        self.sync_node(
            original.node_id,
            TriggerSource::ManualRetry,
            Some(original.id),
            cancel,
        )
        .await
    }

    /// [`Self::sync_node`] on its own task, cancelled only by shutdown. A
    /// caller that goes away cannot leave the job half-written.
    pub async fn sync_node_detached(
        self: &Arc<Self>,
        node_id: i32,
        trigger: TriggerSource,
        parent_job_id: Option<i32>,
    ) -> Result<sync_job::Model, SyncError> {
        let this = self.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move { this.sync_node(node_id, trigger, parent_job_id, &cancel).await })
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
    }

    pub async fn retry_job_detached(self: &Arc<Self>, job_id: i32) -> Result<sync_job::Model, SyncError> {
        let this = self.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move { this.retry_job(job_id, &cancel).await })
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?
    }

    /// Pushes an empty configuration so the node closes every listener.
    pub async fn drain_node(&self, node: &node::Model) -> Result<(), NodeClientError> {
        let lock = self.node_lock(node.id);
        let _guard = lock.lock().await;
        self.client.push_config(node, &SyncPayload::default()).await?;
        info!(node_id = node.id, "Node drained.");
        Ok(())
    }

    /// Syncs every node of the groups, one after the other. Failures are
    /// logged and ledgered per node; the fan-out itself never fails.
    pub async fn sync_groups(&self, group_ids: &[i32], trigger: TriggerSource) -> usize {
        let nodes = match services::list_nodes_in_groups(&self.db, group_ids).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, ?group_ids, "Failed to list nodes for sync fan-out.");
                return 0;
            }
        };
        let mut synced = 0;
        for node in nodes {
            match self.sync_node(node.id, trigger, None, &self.shutdown).await {
                Ok(_) => synced += 1,
                Err(e) => warn!(node_id = node.id, trigger = %trigger, error = %e, "Node sync failed."),
            }
        }
        synced
    }

    /// Runs [`Self::sync_groups`] in the background.
    pub fn spawn_sync_groups(self: &Arc<Self>, group_ids: Vec<i32>, trigger: TriggerSource) {
        if group_ids.is_empty() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.sync_groups(&group_ids, trigger).await;
        });
    }

    /// Runs a single node sync in the background.
    pub fn spawn_sync_node(self: &Arc<Self>, node_id: i32, trigger: TriggerSource) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.sync_node(node_id, trigger, None, &this.shutdown).await {
                warn!(node_id, trigger = %trigger, error = %e, "Node sync failed.");
            }
        });
    }

    async fn finish_noop(&self, job: sync_job::Model) -> Result<sync_job::Model, SyncError> {
        let now = Utc::now();
        let attempt = services::start_sync_attempt(&self.db, job.id, 1, now).await?;
        services::finish_sync_attempt(
            &self.db,
            attempt,
            AttemptOutcome {
                status: SyncAttemptStatus::Success,
                http_status: 200,
                backoff_ms: 0,
                error_summary: String::new(),
            },
            now,
        )
        .await?;
        let job = services::finish_sync_job(
            &self.db,
            job,
            JobOutcome {
                status: SyncJobStatus::Success,
                attempt_count: 1,
                error_summary: String::new(),
                note: Some(NOOP_NOTE.to_string()),
            },
            Utc::now(),
        )
        .await?;
        debug!(node_id = job.node_id, job_id = job.id, "Payload unchanged, push skipped.");
        self.prune(job.node_id).await;
        Ok(job)
    }

    async fn push_with_retry(
        &self,
        job: sync_job::Model,
        node: node::Model,
        payload: SyncPayload,
        cancel: &CancellationToken,
    ) -> Result<sync_job::Model, SyncError> {
        let node_id = node.id;
        let mut attempt_no: u32 = 0;
        loop {
            attempt_no += 1;
            // The node may have been edited while we slept.
            let current = services::get_node(&self.db, node_id).await?;
            let attempt =
                services::start_sync_attempt(&self.db, job.id, attempt_no as i32, Utc::now()).await?;
            let Some(current) = current else {
                let message = "node deleted during sync";
                services::finish_sync_attempt(
                    &self.db,
                    attempt,
                    AttemptOutcome {
                        status: SyncAttemptStatus::Failed,
                        http_status: 0,
                        backoff_ms: 0,
                        error_summary: message.to_string(),
                    },
                    Utc::now(),
                )
                .await?;
                self.fail_job(job, attempt_no, message).await?;
                warn!(node_id, attempts = attempt_no, "Node deleted during sync.");
                return Err(SyncError::NodeNotFound(node_id));
            };
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(NodeClientError::Cancelled),
                r = self.client.push_config(&current, &payload) => r,
            };

            let error = match result {
                Ok(()) => {
                    let now = Utc::now();
                    services::finish_sync_attempt(
                        &self.db,
                        attempt,
                        AttemptOutcome {
                            status: SyncAttemptStatus::Success,
                            http_status: 200,
                            backoff_ms: 0,
                            error_summary: String::new(),
                        },
                        now,
                    )
                    .await?;
                    let job = services::finish_sync_job(
                        &self.db,
                        job,
                        JobOutcome {
                            status: SyncJobStatus::Success,
                            attempt_count: attempt_no as i32,
                            error_summary: String::new(),
                            note: None,
                        },
                        now,
                    )
                    .await?;
                    services::set_node_status(&self.db, node_id, NodeStatus::Online, Some(now))
                        .await?;
                    info!(
                        node_id,
                        job_id = job.id,
                        attempts = attempt_no,
                        trigger = %job.trigger_source,
                        "Node synced."
                    );
                    self.prune(node_id).await;
                    return Ok(job);
                }
                Err(error) => error,
            };

            let cancelled = error == NodeClientError::Cancelled;
            let retry = !cancelled && error.is_transient() && attempt_no < self.policy.max_attempts;
            let backoff = if retry {
                self.policy.backoff(attempt_no)
            } else {
                Duration::ZERO
            };
            services::finish_sync_attempt(
                &self.db,
                attempt,
                AttemptOutcome {
                    status: SyncAttemptStatus::Failed,
                    http_status: error.http_status(),
                    backoff_ms: backoff.as_millis() as i64,
                    error_summary: error_summary(&error.to_string()),
                },
                Utc::now(),
            )
            .await?;

            if cancelled {
                let job = self.fail_job(job, attempt_no, &error.to_string()).await?;
                return Err(SyncError::Cancelled { job: Box::new(job) });
            }
            if !retry {
                let job = self.fail_job(job, attempt_no, &error.to_string()).await?;
                warn!(node_id, job_id = job.id, attempts = attempt_no, error = %error, "Node sync failed.");
                return Err(SyncError::Upstream {
                    job: Box::new(job),
                    error,
                });
            }

            warn!(
                node_id,
                attempt = attempt_no,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Node sync attempt failed, retrying."
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    let job = self
                        .fail_job(job, attempt_no, &NodeClientError::Cancelled.to_string())
                        .await?;
                    return Err(SyncError::Cancelled { job: Box::new(job) });
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn fail_job(
        &self,
        job: sync_job::Model,
        attempt_count: u32,
        message: &str,
    ) -> Result<sync_job::Model, DbErr> {
        let node_id = job.node_id;
        let job = services::finish_sync_job(
            &self.db,
            job,
            JobOutcome {
                status: SyncJobStatus::Failed,
                attempt_count: attempt_count as i32,
                error_summary: error_summary(message),
                note: None,
            },
            Utc::now(),
        )
        .await?;
        self.prune(node_id).await;
        Ok(job)
    }

    async fn prune(&self, node_id: i32) {
        match services::prune_sync_jobs(&self.db, node_id, self.keep_jobs).await {
            Ok(0) => {}
            Ok(n) => debug!(node_id, pruned = n, "Pruned old sync jobs."),
            Err(e) => warn!(node_id, error = %e, "Failed to prune sync jobs."),
        }
    }
}
