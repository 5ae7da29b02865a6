//! Creates missing tables and indexes from the entity definitions.

use sea_orm::sea_query::Index;
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, Schema};
use tracing::info;

use crate::db::entities::{
    admin, group, inbound, node, sync_attempt, sync_job, system_setting, traffic_sample, user,
    user_group,
};

async fn create_table<E>(db: &DatabaseConnection, schema: &Schema, entity: E) -> Result<(), DbErr>
where
    E: EntityTrait,
{
    let backend = db.get_database_backend();
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;

    for mut index in schema.create_index_from_entity(entity) {
        index.if_not_exists();
        db.execute(backend.build(&index)).await?;
    }
    Ok(())
}

pub async fn create_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let schema = Schema::new(db.get_database_backend());

    create_table(db, &schema, admin::Entity).await?;
    create_table(db, &schema, user::Entity).await?;
    create_table(db, &schema, group::Entity).await?;
    create_table(db, &schema, user_group::Entity).await?;
    create_table(db, &schema, node::Entity).await?;
    create_table(db, &schema, inbound::Entity).await?;
    create_table(db, &schema, sync_job::Entity).await?;
    create_table(db, &schema, sync_attempt::Entity).await?;
    create_table(db, &schema, traffic_sample::Entity).await?;
    create_table(db, &schema, system_setting::Entity).await?;

    let backend = db.get_database_backend();
    let extra = [
        Index::create()
            .name("idx_inbounds_node_tag")
            .table(inbound::Entity)
            .col(inbound::Column::NodeId)
            .col(inbound::Column::Tag)
            .unique()
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_sync_jobs_node_id")
            .table(sync_job::Entity)
            .col(sync_job::Column::NodeId)
            .col(sync_job::Column::Id)
            .if_not_exists()
            .to_owned(),
        Index::create()
            .name("idx_sync_attempts_job_id")
            .table(sync_attempt::Entity)
            .col(sync_attempt::Column::JobId)
            .col(sync_attempt::Column::AttemptNo)
            .unique()
            .if_not_exists()
            .to_owned(),
    ];
    for index in extra {
        db.execute(backend.build(&index)).await?;
    }

    info!("Database schema is ready.");
    Ok(())
}
