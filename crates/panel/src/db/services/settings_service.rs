use chrono::Utc;
use sea_orm::{
    sea_query::OnConflict, DatabaseConnection, DbErr, EntityTrait, Set,
};

use crate::db::entities::system_setting;

pub async fn get_setting(
    db: &DatabaseConnection,
    key: &str,
) -> Result<Option<system_setting::Model>, DbErr> {
    system_setting::Entity::find_by_id(key.to_owned()).one(db).await
}

/// Inserts or replaces the value stored under `key`.
pub async fn upsert_setting(
    db: &DatabaseConnection,
    key: &str,
    value: &str,
) -> Result<system_setting::Model, DbErr> {
    let model = system_setting::ActiveModel {
        key: Set(key.to_owned()),
        value: Set(value.to_owned()),
        updated_at: Set(Utc::now()),
    };
    system_setting::Entity::insert(model)
        .on_conflict(
            OnConflict::column(system_setting::Column::Key)
                .update_columns([
                    system_setting::Column::Value,
                    system_setting::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    get_setting(db, key)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound(format!("setting {key}")))
}
