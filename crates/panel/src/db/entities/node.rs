use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::enums::NodeStatus;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub uuid: String,
    pub name: String,
    pub api_address: String,
    pub api_port: i32,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub public_address: String,
    pub group_id: Option<i32>,
    pub status: NodeStatus,
    pub last_seen_at: Option<ChronoDateTimeUtc>,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Base URL of the node agent's HTTP surface.
    pub fn base_url(&self) -> String {
        let address = self.api_address.trim().trim_end_matches('/');
        if address.contains("://") {
            return format!("{address}:{}", self.api_port);
        }
        if address.contains(':') && !address.starts_with('[') {
            return format!("http://[{address}]:{}", self.api_port);
        }
        format!("http://{address}:{}", self.api_port)
    }

    pub fn has_api(&self) -> bool {
        !self.api_address.trim().is_empty() && !self.secret_key.is_empty()
    }
}
