use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::{SyncJobStatus, TriggerSource};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub node_id: i32,
    pub parent_job_id: Option<i32>,
    pub trigger_source: TriggerSource,
    pub status: SyncJobStatus,
    pub inbound_count: i32,
    pub active_user_count: i32,
    pub payload_hash: String,
    pub config_digest: String,
    pub attempt_count: i32,
    pub started_at: Option<ChronoDateTimeUtc>,
    pub finished_at: Option<ChronoDateTimeUtc>,
    pub duration_ms: i64,
    pub error_summary: String,
    pub note: Option<String>,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
