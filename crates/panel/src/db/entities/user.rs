use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::UserStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub uuid: String,
    #[sea_orm(unique)]
    pub username: String,
    /// Bytes; 0 means unlimited.
    pub traffic_limit: i64,
    pub traffic_used: i64,
    /// Day of month the quota resets on; 0 disables.
    pub traffic_reset_day: i32,
    pub traffic_last_reset_at: Option<ChronoDateTimeUtc>,
    pub expire_at: Option<ChronoDateTimeUtc>,
    pub status: UserStatus,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn effective_status(&self, now: DateTime<Utc>) -> UserStatus {
        if self.status == UserStatus::Disabled {
            return UserStatus::Disabled;
        }
        if self.expire_at.is_some_and(|at| at <= now) {
            return UserStatus::Expired;
        }
        if self.traffic_limit > 0 && self.traffic_used >= self.traffic_limit {
            return UserStatus::TrafficExceeded;
        }
        UserStatus::Active
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == UserStatus::Active
    }
}
