use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};

use crate::db::entities::{sync_attempt, sync_job};
use crate::db::enums::{SyncAttemptStatus, SyncJobStatus, TriggerSource};

#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub node_id: i32,
    pub parent_job_id: Option<i32>,
    pub trigger_source: TriggerSource,
    pub payload_hash: String,
    pub config_digest: String,
    pub inbound_count: i32,
    pub active_user_count: i32,
}

/// How a job ended.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: SyncJobStatus,
    pub attempt_count: i32,
    pub error_summary: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub status: SyncAttemptStatus,
    pub http_status: i32,
    pub backoff_ms: i64,
    pub error_summary: String,
}

#[derive(Debug, Clone, Default)]
pub struct SyncJobFilter {
    pub node_id: Option<i32>,
    pub status: Option<SyncJobStatus>,
    pub trigger_source: Option<TriggerSource>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: u64,
    pub offset: u64,
}

fn elapsed_ms(started_at: Option<DateTime<Utc>>, finished_at: DateTime<Utc>) -> i64 {
    started_at
        .map(|started| (finished_at - started).num_milliseconds().max(0))
        .unwrap_or(0)
}

pub async fn create_sync_job(
    db: &DatabaseConnection,
    new_job: NewSyncJob,
) -> Result<sync_job::Model, DbErr> {
    sync_job::ActiveModel {
        node_id: Set(new_job.node_id),
        parent_job_id: Set(new_job.parent_job_id),
        trigger_source: Set(new_job.trigger_source),
        status: Set(SyncJobStatus::Queued),
        inbound_count: Set(new_job.inbound_count),
        active_user_count: Set(new_job.active_user_count),
        payload_hash: Set(new_job.payload_hash),
        config_digest: Set(new_job.config_digest),
        attempt_count: Set(0),
        started_at: Set(None),
        finished_at: Set(None),
        duration_ms: Set(0),
        error_summary: Set(String::new()),
        note: Set(None),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
}

pub async fn mark_sync_job_running(
    db: &DatabaseConnection,
    job: sync_job::Model,
    now: DateTime<Utc>,
) -> Result<sync_job::Model, DbErr> {
    let mut active = job.into_active_model();
    active.status = Set(SyncJobStatus::Running);
    active.started_at = Set(Some(now));
    active.update(db).await
}

pub async fn finish_sync_job(
    db: &DatabaseConnection,
    job: sync_job::Model,
    outcome: JobOutcome,
    now: DateTime<Utc>,
) -> Result<sync_job::Model, DbErr> {
    let duration = elapsed_ms(job.started_at, now);
    let mut active = job.into_active_model();
    active.status = Set(outcome.status);
    active.attempt_count = Set(outcome.attempt_count);
    active.finished_at = Set(Some(now));
    active.duration_ms = Set(duration);
    active.error_summary = Set(outcome.error_summary);
    active.note = Set(outcome.note);
    active.update(db).await
}

pub async fn start_sync_attempt(
    db: &DatabaseConnection,
    job_id: i32,
    attempt_no: i32,
    now: DateTime<Utc>,
) -> Result<sync_attempt::Model, DbErr> {
    sync_attempt::ActiveModel {
        job_id: Set(job_id),
        attempt_no: Set(attempt_no),
        status: Set(SyncAttemptStatus::Running),
        http_status: Set(0),
        backoff_ms: Set(0),
        started_at: Set(now),
        finished_at: Set(None),
        duration_ms: Set(0),
        error_summary: Set(String::new()),
        ..Default::default()
    }
    .insert(db)
    .await
}

pub async fn finish_sync_attempt(
    db: &DatabaseConnection,
    attempt: sync_attempt::Model,
    outcome: AttemptOutcome,
    now: DateTime<Utc>,
) -> Result<sync_attempt::Model, DbErr> {
    let duration = elapsed_ms(Some(attempt.started_at), now);
    let mut active = attempt.into_active_model();
    active.status = Set(outcome.status);
    active.http_status = Set(outcome.http_status);
    active.backoff_ms = Set(outcome.backoff_ms);
    active.finished_at = Set(Some(now));
    active.duration_ms = Set(duration);
    active.error_summary = Set(outcome.error_summary);
    active.update(db).await
}

/// Config digest of the node's most recent successful job.
pub async fn last_success_digest(
    db: &DatabaseConnection,
    node_id: i32,
) -> Result<Option<String>, DbErr> {
    Ok(sync_job::Entity::find()
        .filter(sync_job::Column::NodeId.eq(node_id))
        .filter(sync_job::Column::Status.eq(SyncJobStatus::Success))
        .order_by_desc(sync_job::Column::Id)
        .one(db)
        .await?
        .map(|job| job.config_digest))
}

/// Deletes all but the newest `keep` jobs of the node, with their attempts.
pub async fn prune_sync_jobs(db: &DatabaseConnection, node_id: i32, keep: u64) -> Result<u64, DbErr> {
    let ids: Vec<i32> = sync_job::Entity::find()
        .select_only()
        .column(sync_job::Column::Id)
        .filter(sync_job::Column::NodeId.eq(node_id))
        .order_by_desc(sync_job::Column::Id)
        .into_tuple()
        .all(db)
        .await?;
    let stale: Vec<i32> = ids.into_iter().skip(keep as usize).collect();
    if stale.is_empty() {
        return Ok(0);
    }

    let txn = db.begin().await?;
    sync_attempt::Entity::delete_many()
        .filter(sync_attempt::Column::JobId.is_in(stale.iter().copied()))
        .exec(&txn)
        .await?;
    let result = sync_job::Entity::delete_many()
        .filter(sync_job::Column::Id.is_in(stale.iter().copied()))
        .exec(&txn)
        .await?;
    txn.commit().await?;
    Ok(result.rows_affected)
}

/// Newest first.
pub async fn list_sync_jobs(
    db: &DatabaseConnection,
    filter: &SyncJobFilter,
) -> Result<Vec<sync_job::Model>, DbErr> {
    let mut query = sync_job::Entity::find().order_by_desc(sync_job::Column::Id);
    if let Some(node_id) = filter.node_id {
        query = query.filter(sync_job::Column::NodeId.eq(node_id));
    }
    if let Some(status) = filter.status {
        query = query.filter(sync_job::Column::Status.eq(status));
    }
    if let Some(trigger) = filter.trigger_source {
        query = query.filter(sync_job::Column::TriggerSource.eq(trigger));
    }
    if let Some(from) = filter.from {
        query = query.filter(sync_job::Column::CreatedAt.gte(from));
    }
    if let Some(to) = filter.to {
        query = query.filter(sync_job::Column::CreatedAt.lte(to));
    }
    query
        .limit(filter.limit)
        .offset(filter.offset)
        .all(db)
        .await
}

pub async fn get_sync_job(db: &DatabaseConnection, id: i32) -> Result<Option<sync_job::Model>, DbErr> {
    sync_job::Entity::find_by_id(id).one(db).await
}

pub async fn list_sync_attempts(
    db: &DatabaseConnection,
    job_id: i32,
) -> Result<Vec<sync_attempt::Model>, DbErr> {
    sync_attempt::Entity::find()
        .filter(sync_attempt::Column::JobId.eq(job_id))
        .order_by_asc(sync_attempt::Column::AttemptNo)
        .all(db)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn new_job(node_id: i32, trigger: TriggerSource) -> NewSyncJob {
        NewSyncJob {
            node_id,
            parent_job_id: None,
            trigger_source: trigger,
            payload_hash: "h".to_string(),
            config_digest: "d".to_string(),
            inbound_count: 1,
            active_user_count: 2,
        }
    }

    async fn finished_job(db: &DatabaseConnection, node_id: i32, status: SyncJobStatus) -> sync_job::Model {
        let now = Utc::now();
        let job = create_sync_job(db, new_job(node_id, TriggerSource::ManualSyncNode))
            .await
            .unwrap();
        let job = mark_sync_job_running(db, job, now).await.unwrap();
        let attempt = start_sync_attempt(db, job.id, 1, now).await.unwrap();
        finish_sync_attempt(
            db,
            attempt,
            AttemptOutcome {
                status: SyncAttemptStatus::Success,
                http_status: 200,
                backoff_ms: 0,
                error_summary: String::new(),
            },
            now,
        )
        .await
        .unwrap();
        finish_sync_job(
            db,
            job,
            JobOutcome { status, attempt_count: 1, error_summary: String::new(), note: None },
            now,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn prune_keeps_newest_jobs_and_drops_attempts() {
        let db = test_db().await;
        let first = finished_job(&db, 1, SyncJobStatus::Success).await;
        let second = finished_job(&db, 1, SyncJobStatus::Failed).await;
        let other = finished_job(&db, 2, SyncJobStatus::Success).await;

        assert_eq!(prune_sync_jobs(&db, 1, 1).await.unwrap(), 1);
        assert!(get_sync_job(&db, first.id).await.unwrap().is_none());
        assert!(list_sync_attempts(&db, first.id).await.unwrap().is_empty());
        assert!(get_sync_job(&db, second.id).await.unwrap().is_some());
        assert!(get_sync_job(&db, other.id).await.unwrap().is_some());
        assert_eq!(prune_sync_jobs(&db, 1, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn last_success_digest_ignores_failures() {
        let db = test_db().await;
        assert!(last_success_digest(&db, 1).await.unwrap().is_none());
        finished_job(&db, 1, SyncJobStatus::Failed).await;
        assert!(last_success_digest(&db, 1).await.unwrap().is_none());
        finished_job(&db, 1, SyncJobStatus::Success).await;
        assert_eq!(last_success_digest(&db, 1).await.unwrap().as_deref(), Some("d"));
    }

    #[tokio::test]
    async fn list_applies_filters_and_paging() {
        let db = test_db().await;
        for _ in 0..3 {
            finished_job(&db, 1, SyncJobStatus::Success).await;
        }
        finished_job(&db, 2, SyncJobStatus::Failed).await;

        let all = SyncJobFilter { limit: 50, ..Default::default() };
        assert_eq!(list_sync_jobs(&db, &all).await.unwrap().len(), 4);

        let failed = SyncJobFilter {
            status: Some(SyncJobStatus::Failed),
            limit: 50,
            ..Default::default()
        };
        let jobs = list_sync_jobs(&db, &failed).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].node_id, 2);

        let paged = SyncJobFilter { node_id: Some(1), limit: 2, offset: 2, ..Default::default() };
        assert_eq!(list_sync_jobs(&db, &paged).await.unwrap().len(), 1);

        let future = SyncJobFilter {
            from: Some(Utc::now() + chrono::Duration::hours(1)),
            limit: 50,
            ..Default::default()
        };
        assert!(list_sync_jobs(&db, &future).await.unwrap().is_empty());
    }
}
