use chrono::{DateTime, Utc};
use sea_orm::{
    prelude::Expr, ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    QueryFilter, QueryOrder, Set, TransactionTrait, Value,
};
use uuid::Uuid;

use crate::db::entities::{inbound, node};
use crate::db::enums::NodeStatus;

#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub name: String,
    pub api_address: String,
    pub api_port: i32,
    pub secret_key: String,
    pub public_address: String,
    pub group_id: Option<i32>,
}

/// `group_id: Some(None)` detaches the node from its group.
#[derive(Debug, Clone, Default)]
pub struct NodeChanges {
    pub name: Option<String>,
    pub api_address: Option<String>,
    pub api_port: Option<i32>,
    pub secret_key: Option<String>,
    pub public_address: Option<String>,
    pub group_id: Option<Option<i32>>,
}

pub async fn create_node(db: &DatabaseConnection, new_node: NewNode) -> Result<node::Model, DbErr> {
    let now = Utc::now();
    node::ActiveModel {
        uuid: Set(Uuid::new_v4().to_string()),
        name: Set(new_node.name),
        api_address: Set(new_node.api_address),
        api_port: Set(new_node.api_port),
        secret_key: Set(new_node.secret_key),
        public_address: Set(new_node.public_address),
        group_id: Set(new_node.group_id),
        status: Set(NodeStatus::Offline),
        last_seen_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
}

pub async fn get_node(db: &DatabaseConnection, id: i32) -> Result<Option<node::Model>, DbErr> {
    node::Entity::find_by_id(id).one(db).await
}

pub async fn list_nodes(db: &DatabaseConnection) -> Result<Vec<node::Model>, DbErr> {
    node::Entity::find()
        .order_by_asc(node::Column::Id)
        .all(db)
        .await
}

pub async fn list_nodes_in_groups(
    db: &DatabaseConnection,
    group_ids: &[i32],
) -> Result<Vec<node::Model>, DbErr> {
    if group_ids.is_empty() {
        return Ok(Vec::new());
    }
    node::Entity::find()
        .filter(node::Column::GroupId.is_in(group_ids.iter().copied()))
        .order_by_asc(node::Column::Id)
        .all(db)
        .await
}

pub async fn update_node(
    db: &DatabaseConnection,
    id: i32,
    changes: NodeChanges,
) -> Result<Option<node::Model>, DbErr> {
    let Some(model) = get_node(db, id).await? else {
        return Ok(None);
    };
    let mut active: node::ActiveModel = model.into_active_model();
    if let Some(name) = changes.name {
        active.name = Set(name);
    }
    if let Some(address) = changes.api_address {
        active.api_address = Set(address);
    }
    if let Some(port) = changes.api_port {
        active.api_port = Set(port);
    }
    if let Some(secret) = changes.secret_key {
        active.secret_key = Set(secret);
    }
    if let Some(address) = changes.public_address {
        active.public_address = Set(address);
    }
    if let Some(group_id) = changes.group_id {
        active.group_id = Set(group_id);
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await.map(Some)
}

/// Stores a health check outcome. `last_seen_at` is only moved forward when given.
pub async fn set_node_status(
    db: &DatabaseConnection,
    id: i32,
    status: NodeStatus,
    last_seen_at: Option<DateTime<Utc>>,
) -> Result<(), DbErr> {
    let mut update = node::Entity::update_many()
        .col_expr(node::Column::Status, Expr::value(status.to_value()))
        .filter(node::Column::Id.eq(id));
    if let Some(seen) = last_seen_at {
        update = update.col_expr(
            node::Column::LastSeenAt,
            Expr::value(Value::ChronoDateTimeUtc(Some(Box::new(seen)))),
        );
    }
    update.exec(db).await?;
    Ok(())
}

/// Deletes the node and its inbounds together. Returns the number of
/// inbounds removed.
pub async fn delete_node(db: &DatabaseConnection, id: i32) -> Result<u64, DbErr> {
    let txn = db.begin().await?;
    let inbounds = inbound::Entity::delete_many()
        .filter(inbound::Column::NodeId.eq(id))
        .exec(&txn)
        .await?
        .rows_affected;
    node::Entity::delete_by_id(id).exec(&txn).await?;
    txn.commit().await?;
    Ok(inbounds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn new_node(name: &str) -> NewNode {
        NewNode {
            name: name.into(),
            api_address: "10.0.0.1".into(),
            api_port: 8081,
            secret_key: "s".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn status_updates_keep_last_seen_unless_given() {
        let db = test_db().await;
        let node = create_node(&db, new_node("n1")).await.unwrap();
        assert_eq!(node.status, NodeStatus::Offline);

        let seen = Utc::now();
        set_node_status(&db, node.id, NodeStatus::Online, Some(seen)).await.unwrap();
        let stored = get_node(&db, node.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Online);
        assert_eq!(stored.last_seen_at.map(|t| t.timestamp()), Some(seen.timestamp()));

        set_node_status(&db, node.id, NodeStatus::Offline, None).await.unwrap();
        let stored = get_node(&db, node.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Offline);
        assert!(stored.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn group_can_be_detached() {
        let db = test_db().await;
        let group = crate::db::services::create_group(&db, "g", "").await.unwrap();
        let node = create_node(&db, NewNode { group_id: Some(group.id), ..new_node("n1") })
            .await
            .unwrap();
        let updated = update_node(&db, node.id, NodeChanges { group_id: Some(None), ..Default::default() })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.group_id, None);
        assert!(list_nodes_in_groups(&db, &[group.id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_takes_the_inbounds_along() {
        let db = test_db().await;
        let node = create_node(&db, new_node("n1")).await.unwrap();
        let other = create_node(&db, new_node("n2")).await.unwrap();
        for (node_id, tag) in [(node.id, "a"), (node.id, "b"), (other.id, "a")] {
            crate::db::services::create_inbound(
                &db,
                crate::db::services::NewInbound {
                    node_id,
                    tag: tag.into(),
                    protocol: "vless".into(),
                    listen_port: 443,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }

        assert_eq!(delete_node(&db, node.id).await.unwrap(), 2);
        assert!(get_node(&db, node.id).await.unwrap().is_none());
        assert!(crate::db::services::list_inbounds(&db, Some(node.id)).await.unwrap().is_empty());
        assert_eq!(crate::db::services::list_inbounds(&db, Some(other.id)).await.unwrap().len(), 1);
    }
}
