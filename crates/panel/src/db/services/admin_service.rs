use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, Set,
};

use crate::db::entities::admin;

pub async fn count_admins(db: &DatabaseConnection) -> Result<u64, DbErr> {
    admin::Entity::find().count(db).await
}

pub async fn find_admin_by_username(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Option<admin::Model>, DbErr> {
    admin::Entity::find()
        .filter(admin::Column::Username.eq(username))
        .one(db)
        .await
}

pub async fn create_admin(
    db: &DatabaseConnection,
    username: &str,
    password_hash: &str,
) -> Result<admin::Model, DbErr> {
    admin::ActiveModel {
        username: Set(username.to_owned()),
        password_hash: Set(password_hash.to_owned()),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
}
