pub mod entities;
pub mod enums;
pub mod schema;
pub mod services;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use std::time::Duration;

/// Opens the store and makes sure the schema exists.
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(url.to_owned());
    opt.sqlx_logging(false);
    if url.contains(":memory:") {
        // Every pooled connection would otherwise open its own empty database.
        opt.max_connections(1)
            .min_connections(1)
            .idle_timeout(Duration::from_secs(u32::MAX as u64))
            .max_lifetime(Duration::from_secs(u32::MAX as u64));
    } else {
        opt.max_connections(10);
    }

    let db = Database::connect(opt).await?;
    schema::create_schema(&db).await?;
    Ok(db)
}

#[cfg(test)]
pub(crate) async fn test_db() -> DatabaseConnection {
    connect("sqlite::memory:").await.expect("in-memory database")
}
