use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::SyncAttemptStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_attempts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub job_id: i32,
    /// 1-based, contiguous within a job.
    pub attempt_no: i32,
    pub status: SyncAttemptStatus,
    /// 0 for transport failures.
    pub http_status: i32,
    /// Sleep taken after this attempt, before the next one.
    pub backoff_ms: i64,
    pub started_at: ChronoDateTimeUtc,
    pub finished_at: Option<ChronoDateTimeUtc>,
    pub duration_ms: i64,
    pub error_summary: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
