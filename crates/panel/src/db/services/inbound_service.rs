use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, Set,
};
use serde_json::Value;
use uuid::Uuid;

use crate::db::entities::inbound;

#[derive(Debug, Clone, Default)]
pub struct NewInbound {
    pub node_id: i32,
    pub tag: String,
    pub protocol: String,
    pub listen_port: i32,
    pub public_port: i32,
    pub settings: Value,
    pub tls_settings: Option<Value>,
    pub transport_settings: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct InboundChanges {
    pub tag: Option<String>,
    pub protocol: Option<String>,
    pub listen_port: Option<i32>,
    pub public_port: Option<i32>,
    pub settings: Option<Value>,
    pub tls_settings: Option<Option<Value>>,
    pub transport_settings: Option<Option<Value>>,
}

pub async fn create_inbound(
    db: &DatabaseConnection,
    new_inbound: NewInbound,
) -> Result<inbound::Model, DbErr> {
    let now = Utc::now();
    inbound::ActiveModel {
        uuid: Set(Uuid::new_v4().to_string()),
        node_id: Set(new_inbound.node_id),
        tag: Set(new_inbound.tag),
        protocol: Set(new_inbound.protocol),
        listen_port: Set(new_inbound.listen_port),
        public_port: Set(new_inbound.public_port),
        settings: Set(new_inbound.settings),
        tls_settings: Set(new_inbound.tls_settings),
        transport_settings: Set(new_inbound.transport_settings),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
}

pub async fn get_inbound(db: &DatabaseConnection, id: i32) -> Result<Option<inbound::Model>, DbErr> {
    inbound::Entity::find_by_id(id).one(db).await
}

pub async fn list_inbounds(
    db: &DatabaseConnection,
    node_id: Option<i32>,
) -> Result<Vec<inbound::Model>, DbErr> {
    let mut query = inbound::Entity::find().order_by_asc(inbound::Column::Id);
    if let Some(node_id) = node_id {
        query = query.filter(inbound::Column::NodeId.eq(node_id));
    }
    query.all(db).await
}

pub async fn find_inbound_by_tag(
    db: &DatabaseConnection,
    node_id: i32,
    tag: &str,
) -> Result<Option<inbound::Model>, DbErr> {
    inbound::Entity::find()
        .filter(inbound::Column::NodeId.eq(node_id))
        .filter(inbound::Column::Tag.eq(tag))
        .one(db)
        .await
}

pub async fn update_inbound(
    db: &DatabaseConnection,
    id: i32,
    changes: InboundChanges,
) -> Result<Option<inbound::Model>, DbErr> {
    let Some(model) = get_inbound(db, id).await? else {
        return Ok(None);
    };
    let mut active: inbound::ActiveModel = model.into_active_model();
    if let Some(tag) = changes.tag {
        active.tag = Set(tag);
    }
    if let Some(protocol) = changes.protocol {
        active.protocol = Set(protocol);
    }
    if let Some(port) = changes.listen_port {
        active.listen_port = Set(port);
    }
    if let Some(port) = changes.public_port {
        active.public_port = Set(port);
    }
    if let Some(settings) = changes.settings {
        active.settings = Set(settings);
    }
    if let Some(tls) = changes.tls_settings {
        active.tls_settings = Set(tls);
    }
    if let Some(transport) = changes.transport_settings {
        active.transport_settings = Set(transport);
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await.map(Some)
}

pub async fn delete_inbound(db: &DatabaseConnection, id: i32) -> Result<u64, DbErr> {
    Ok(inbound::Entity::delete_by_id(id).exec(db).await?.rows_affected)
}
