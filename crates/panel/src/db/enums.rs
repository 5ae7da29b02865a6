use sea_orm::entity::prelude::*;
use sea_orm::Iterable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stored user status. See `user::Model::effective_status` for the status
/// the rest of the panel acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "disabled")]
    Disabled,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "traffic_exceeded")]
    TrafficExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[sea_orm(string_value = "online")]
    Online,
    #[sea_orm(string_value = "offline")]
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "failed")]
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum SyncAttemptStatus {
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "success")]
    Success,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// What asked for a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    #[sea_orm(string_value = "manual_sync_node")]
    ManualSyncNode,
    #[sea_orm(string_value = "manual_retry")]
    ManualRetry,
    #[sea_orm(string_value = "auto_inbound_change")]
    AutoInboundChange,
    #[sea_orm(string_value = "auto_user_change")]
    AutoUserChange,
    #[sea_orm(string_value = "auto_group_membership_change")]
    AutoGroupMembershipChange,
    #[sea_orm(string_value = "auto_node_recovery")]
    AutoNodeRecovery,
}

impl TriggerSource {
    /// Automatic triggers that may skip the push when nothing changed.
    pub fn is_dedupable(self) -> bool {
        matches!(
            self,
            TriggerSource::AutoInboundChange
                | TriggerSource::AutoUserChange
                | TriggerSource::AutoGroupMembershipChange
        )
    }
}

macro_rules! text_enum {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_value())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                <$ty>::iter()
                    .find(|v| v.to_value() == s)
                    .ok_or_else(|| format!("unknown {}: {s}", stringify!($ty)))
            }
        }
    };
}

text_enum!(UserStatus);
text_enum!(NodeStatus);
text_enum!(SyncJobStatus);
text_enum!(SyncAttemptStatus);
text_enum!(TriggerSource);
