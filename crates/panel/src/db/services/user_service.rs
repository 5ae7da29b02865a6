use chrono::{DateTime, Utc};
use sea_orm::{
    prelude::Expr, sea_query::Query, ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr,
    EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use uuid::Uuid;

use crate::db::entities::{user, user_group};
use crate::db::enums::UserStatus;

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub uuid: Option<String>,
    pub traffic_limit: i64,
    pub traffic_reset_day: i32,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Fields left `None` are not touched. `expire_at: Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub username: Option<String>,
    pub uuid: Option<String>,
    pub traffic_limit: Option<i64>,
    pub traffic_used: Option<i64>,
    pub traffic_reset_day: Option<i32>,
    pub expire_at: Option<Option<DateTime<Utc>>>,
    pub status: Option<UserStatus>,
}

pub async fn create_user(db: &DatabaseConnection, new_user: NewUser) -> Result<user::Model, DbErr> {
    let now = Utc::now();
    user::ActiveModel {
        uuid: Set(new_user
            .uuid
            .unwrap_or_else(|| Uuid::new_v4().to_string())),
        username: Set(new_user.username),
        traffic_limit: Set(new_user.traffic_limit),
        traffic_used: Set(0),
        traffic_reset_day: Set(new_user.traffic_reset_day),
        traffic_last_reset_at: Set(None),
        expire_at: Set(new_user.expire_at),
        status: Set(UserStatus::Active),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
}

pub async fn get_user(db: &DatabaseConnection, id: i32) -> Result<Option<user::Model>, DbErr> {
    user::Entity::find_by_id(id).one(db).await
}

pub async fn get_user_by_uuid(
    db: &DatabaseConnection,
    uuid: &str,
) -> Result<Option<user::Model>, DbErr> {
    user::Entity::find()
        .filter(user::Column::Uuid.eq(uuid))
        .one(db)
        .await
}

pub async fn get_user_by_username(
    db: &DatabaseConnection,
    username: &str,
) -> Result<Option<user::Model>, DbErr> {
    user::Entity::find()
        .filter(user::Column::Username.eq(username))
        .one(db)
        .await
}

pub async fn list_users(db: &DatabaseConnection) -> Result<Vec<user::Model>, DbErr> {
    user::Entity::find()
        .order_by_asc(user::Column::Id)
        .all(db)
        .await
}

/// Users filtered by effective status at `now`.
pub async fn list_users_by_status(
    db: &DatabaseConnection,
    status: UserStatus,
    now: DateTime<Utc>,
) -> Result<Vec<user::Model>, DbErr> {
    Ok(list_users(db)
        .await?
        .into_iter()
        .filter(|u| u.effective_status(now) == status)
        .collect())
}

pub async fn update_user(
    db: &DatabaseConnection,
    id: i32,
    changes: UserChanges,
) -> Result<Option<user::Model>, DbErr> {
    let Some(model) = get_user(db, id).await? else {
        return Ok(None);
    };
    let mut active: user::ActiveModel = model.into_active_model();
    if let Some(username) = changes.username {
        active.username = Set(username);
    }
    if let Some(uuid) = changes.uuid {
        active.uuid = Set(uuid);
    }
    if let Some(limit) = changes.traffic_limit {
        active.traffic_limit = Set(limit);
    }
    if let Some(used) = changes.traffic_used {
        active.traffic_used = Set(used);
    }
    if let Some(day) = changes.traffic_reset_day {
        active.traffic_reset_day = Set(day);
    }
    if let Some(expire_at) = changes.expire_at {
        active.expire_at = Set(expire_at);
    }
    if let Some(status) = changes.status {
        active.status = Set(status);
    }
    active.updated_at = Set(Utc::now());
    active.update(db).await.map(Some)
}

/// Removes the user and its memberships.
pub async fn delete_user(db: &DatabaseConnection, id: i32) -> Result<u64, DbErr> {
    let txn = db.begin().await?;
    user_group::Entity::delete_many()
        .filter(user_group::Column::UserId.eq(id))
        .exec(&txn)
        .await?;
    let result = user::Entity::delete_by_id(id).exec(&txn).await?;
    txn.commit().await?;
    Ok(result.rows_affected)
}

pub async fn list_user_group_ids(db: &DatabaseConnection, user_id: i32) -> Result<Vec<i32>, DbErr> {
    Ok(user_group::Entity::find()
        .filter(user_group::Column::UserId.eq(user_id))
        .order_by_asc(user_group::Column::GroupId)
        .all(db)
        .await?
        .into_iter()
        .map(|m| m.group_id)
        .collect())
}

/// Replaces the user's memberships. Returns the previous group ids.
pub async fn set_user_groups(
    db: &DatabaseConnection,
    user_id: i32,
    group_ids: &[i32],
) -> Result<Vec<i32>, DbErr> {
    let previous = list_user_group_ids(db, user_id).await?;

    let mut wanted = group_ids.to_vec();
    wanted.sort_unstable();
    wanted.dedup();

    let txn = db.begin().await?;
    user_group::Entity::delete_many()
        .filter(user_group::Column::UserId.eq(user_id))
        .exec(&txn)
        .await?;
    if !wanted.is_empty() {
        user_group::Entity::insert_many(wanted.iter().map(|&group_id| user_group::ActiveModel {
            user_id: Set(user_id),
            group_id: Set(group_id),
        }))
        .exec_without_returning(&txn)
        .await?;
    }
    txn.commit().await?;
    Ok(previous)
}

/// Members of the group whose effective status is `active`, by id.
pub async fn list_active_users_for_group(
    db: &DatabaseConnection,
    group_id: i32,
    now: DateTime<Utc>,
) -> Result<Vec<user::Model>, DbErr> {
    let members = Query::select()
        .column(user_group::Column::UserId)
        .from(user_group::Entity)
        .and_where(user_group::Column::GroupId.eq(group_id))
        .to_owned();

    Ok(user::Entity::find()
        .filter(user::Column::Id.in_subquery(members))
        .order_by_asc(user::Column::Id)
        .all(db)
        .await?
        .into_iter()
        .filter(|u| u.is_active(now))
        .collect())
}

/// `traffic_used += bytes` in one statement.
pub async fn add_user_traffic(db: &DatabaseConnection, user_id: i32, bytes: i64) -> Result<(), DbErr> {
    user::Entity::update_many()
        .col_expr(
            user::Column::TrafficUsed,
            Expr::col(user::Column::TrafficUsed).add(bytes),
        )
        .filter(user::Column::Id.eq(user_id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn reset_user_traffic(
    db: &DatabaseConnection,
    user_id: i32,
    now: DateTime<Utc>,
) -> Result<Option<user::Model>, DbErr> {
    let Some(model) = get_user(db, user_id).await? else {
        return Ok(None);
    };
    let mut active: user::ActiveModel = model.into_active_model();
    active.traffic_used = Set(0);
    active.traffic_last_reset_at = Set(Some(now));
    active.updated_at = Set(now);
    active.update(db).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::services::create_group;
    use crate::db::test_db;
    use chrono::Duration;

    #[tokio::test]
    async fn active_selection_matches_effective_status() {
        let db = test_db().await;
        let group = create_group(&db, "g", "").await.unwrap();
        let now = Utc::now();

        let active = create_user(&db, NewUser { username: "active".into(), ..Default::default() })
            .await
            .unwrap();
        let expired = create_user(
            &db,
            NewUser {
                username: "expired".into(),
                expire_at: Some(now - Duration::hours(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let exceeded = create_user(
            &db,
            NewUser { username: "exceeded".into(), traffic_limit: 1024, ..Default::default() },
        )
        .await
        .unwrap();
        add_user_traffic(&db, exceeded.id, 1024).await.unwrap();

        for user in [&active, &expired, &exceeded] {
            set_user_groups(&db, user.id, &[group.id]).await.unwrap();
        }

        let selected = list_active_users_for_group(&db, group.id, now).await.unwrap();
        assert_eq!(selected.iter().map(|u| u.id).collect::<Vec<_>>(), vec![active.id]);

        let by_status = list_users_by_status(&db, UserStatus::Expired, now).await.unwrap();
        assert_eq!(by_status.iter().map(|u| u.id).collect::<Vec<_>>(), vec![expired.id]);
        let by_status = list_users_by_status(&db, UserStatus::TrafficExceeded, now)
            .await
            .unwrap();
        assert_eq!(by_status.iter().map(|u| u.id).collect::<Vec<_>>(), vec![exceeded.id]);

        // Every active member is selected, every selected user is active.
        for user in list_users(&db).await.unwrap() {
            let selected_ids: Vec<i32> = selected.iter().map(|u| u.id).collect();
            assert_eq!(user.is_active(now), selected_ids.contains(&user.id));
        }
    }

    #[tokio::test]
    async fn disabled_wins_over_other_states() {
        let db = test_db().await;
        let now = Utc::now();
        let user = create_user(
            &db,
            NewUser {
                username: "u".into(),
                expire_at: Some(now - Duration::days(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let user = update_user(
            &db,
            user.id,
            UserChanges { status: Some(UserStatus::Disabled), ..Default::default() },
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(user.effective_status(now), UserStatus::Disabled);
    }

    #[tokio::test]
    async fn set_groups_returns_previous_membership() {
        let db = test_db().await;
        let a = create_group(&db, "a", "").await.unwrap();
        let b = create_group(&db, "b", "").await.unwrap();
        let user = create_user(&db, NewUser { username: "u".into(), ..Default::default() })
            .await
            .unwrap();

        assert!(set_user_groups(&db, user.id, &[a.id, a.id]).await.unwrap().is_empty());
        assert_eq!(set_user_groups(&db, user.id, &[b.id]).await.unwrap(), vec![a.id]);
        assert_eq!(list_user_group_ids(&db, user.id).await.unwrap(), vec![b.id]);

        delete_user(&db, user.id).await.unwrap();
        assert!(list_user_group_ids(&db, user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn traffic_add_and_reset() {
        let db = test_db().await;
        let user = create_user(&db, NewUser { username: "u".into(), ..Default::default() })
            .await
            .unwrap();
        add_user_traffic(&db, user.id, 100).await.unwrap();
        add_user_traffic(&db, user.id, 23).await.unwrap();
        assert_eq!(get_user(&db, user.id).await.unwrap().unwrap().traffic_used, 123);

        let now = Utc::now();
        let user = reset_user_traffic(&db, user.id, now).await.unwrap().unwrap();
        assert_eq!(user.traffic_used, 0);
        assert!(user.traffic_last_reset_at.is_some());
    }
}
