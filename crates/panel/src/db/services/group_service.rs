use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, IntoActiveModel,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};

use crate::db::entities::{group, node, user_group};

pub async fn create_group(
    db: &DatabaseConnection,
    name: &str,
    description: &str,
) -> Result<group::Model, DbErr> {
    let now = Utc::now();
    group::ActiveModel {
        name: Set(name.to_owned()),
        description: Set(description.to_owned()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
}

pub async fn get_group(db: &DatabaseConnection, id: i32) -> Result<Option<group::Model>, DbErr> {
    group::Entity::find_by_id(id).one(db).await
}

pub async fn list_groups(db: &DatabaseConnection) -> Result<Vec<group::Model>, DbErr> {
    group::Entity::find()
        .order_by_asc(group::Column::Id)
        .all(db)
        .await
}

pub async fn update_group(
    db: &DatabaseConnection,
    id: i32,
    name: Option<String>,
    description: Option<String>,
) -> Result<Option<group::Model>, DbErr> {
    let Some(model) = get_group(db, id).await? else {
        return Ok(None);
    };
    let mut active: group::ActiveModel = model.into_active_model();
    if let Some(name) = name {
        active.name = Set(name);
    }
    if let Some(description) = description {
        active.description = Set(description);
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await.map(Some)
}

pub async fn count_nodes_in_group(db: &DatabaseConnection, group_id: i32) -> Result<u64, DbErr> {
    node::Entity::find()
        .filter(node::Column::GroupId.eq(group_id))
        .count(db)
        .await
}

/// Deletes the group and its memberships.
pub async fn delete_group(db: &DatabaseConnection, id: i32) -> Result<u64, DbErr> {
    let txn = db.begin().await?;
    user_group::Entity::delete_many()
        .filter(user_group::Column::GroupId.eq(id))
        .exec(&txn)
        .await?;
    let result = group::Entity::delete_by_id(id).exec(&txn).await?;
    txn.commit().await?;
    Ok(result.rows_affected)
}
