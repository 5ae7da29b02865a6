use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "inbounds")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(unique)]
    pub uuid: String,
    pub node_id: i32,
    pub tag: String,
    pub protocol: String,
    pub listen_port: i32,
    /// Port advertised to clients; 0 falls back to `listen_port`.
    pub public_port: i32,
    pub settings: Json,
    pub tls_settings: Option<Json>,
    pub transport_settings: Option<Json>,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn advertised_port(&self) -> i32 {
        if self.public_port > 0 {
            self.public_port
        } else {
            self.listen_port
        }
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(Json::as_str)
            .filter(|s| !s.is_empty())
    }
}
