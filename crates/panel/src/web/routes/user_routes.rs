use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::entities::user;
use crate::db::enums::{TriggerSource, UserStatus};
use crate::db::services::{self, NewUser, UserChanges};
use crate::web::models::double_option;
use crate::web::{AppError, AppState};

#[derive(Deserialize)]
pub struct CreateUserRequest {
    username: String,
    uuid: Option<String>,
    #[serde(default)]
    traffic_limit: i64,
    #[serde(default)]
    traffic_reset_day: i32,
    expire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    group_ids: Vec<i32>,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    username: Option<String>,
    uuid: Option<String>,
    traffic_limit: Option<i64>,
    traffic_reset_day: Option<i32>,
    #[serde(default, deserialize_with = "double_option")]
    expire_at: Option<Option<DateTime<Utc>>>,
    status: Option<UserStatus>,
}

#[derive(Deserialize)]
pub struct SetGroupsRequest {
    group_ids: Vec<i32>,
}

#[derive(Deserialize, Default)]
pub struct ListUsersQuery {
    status: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct DeleteUserQuery {
    #[serde(default)]
    hard: bool,
}

#[derive(Serialize)]
pub struct UserResponse {
    #[serde(flatten)]
    user: user::Model,
    effective_status: UserStatus,
    group_ids: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription_url: Option<String>,
}

async fn user_response(app_state: &AppState, user: user::Model) -> Result<UserResponse, AppError> {
    let group_ids = services::list_user_group_ids(&app_state.db, user.id).await?;
    let subscription_url = app_state
        .config
        .subscription_base_url
        .as_deref()
        .map(|base| format!("{}/sub/{}", base.trim_end_matches('/'), user.uuid));
    Ok(UserResponse {
        effective_status: user.effective_status(Utc::now()),
        user,
        group_ids,
        subscription_url,
    })
}

fn validate_uuid(raw: &str) -> Result<String, AppError> {
    Uuid::parse_str(raw.trim())
        .map(|u| u.to_string())
        .map_err(|_| AppError::BadRequest(format!("invalid uuid: {raw}")))
}

fn validate_quota(limit: Option<i64>, reset_day: Option<i32>) -> Result<(), AppError> {
    if limit.is_some_and(|l| l < 0) {
        return Err(AppError::BadRequest("traffic_limit must not be negative".to_string()));
    }
    if reset_day.is_some_and(|d| !(0..=31).contains(&d)) {
        return Err(AppError::BadRequest("traffic_reset_day must be between 0 and 31".to_string()));
    }
    Ok(())
}

async fn ensure_groups_exist(app_state: &AppState, group_ids: &[i32]) -> Result<(), AppError> {
    for &group_id in group_ids {
        if services::get_group(&app_state.db, group_id).await?.is_none() {
            return Err(AppError::BadRequest(format!("group {group_id} does not exist")));
        }
    }
    Ok(())
}

async fn load_user(app_state: &AppState, user_id: i32) -> Result<user::Model, AppError> {
    services::get_user(&app_state.db, user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".to_string()))
}

async fn list_users_handler(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<Vec<UserResponse>>, AppError> {
    let users = match query.status.as_deref().map(str::trim) {
        None | Some("") => services::list_users(&app_state.db).await?,
        Some(raw) => {
            let status = raw.parse::<UserStatus>().map_err(AppError::BadRequest)?;
            services::list_users_by_status(&app_state.db, status, Utc::now()).await?
        }
    };
    let mut response = Vec::with_capacity(users.len());
    for user in users {
        response.push(user_response(&app_state, user).await?);
    }
    Ok(Json(response))
}

async fn create_user_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    let username = payload.username.trim().to_string();
    if username.is_empty() {
        return Err(AppError::BadRequest("username is required".to_string()));
    }
    validate_quota(Some(payload.traffic_limit), Some(payload.traffic_reset_day))?;
    let uuid = payload.uuid.as_deref().map(validate_uuid).transpose()?;
    ensure_groups_exist(&app_state, &payload.group_ids).await?;

    let user = services::create_user(
        &app_state.db,
        NewUser {
            username,
            uuid,
            traffic_limit: payload.traffic_limit,
            traffic_reset_day: payload.traffic_reset_day,
            expire_at: payload.expire_at,
        },
    )
    .await?;
    if !payload.group_ids.is_empty() {
        services::set_user_groups(&app_state.db, user.id, &payload.group_ids).await?;
        app_state
            .orchestrator
            .spawn_sync_groups(payload.group_ids.clone(), TriggerSource::AutoGroupMembershipChange);
    }
    Ok((StatusCode::CREATED, Json(user_response(&app_state, user).await?)))
}

async fn get_user_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<i32>,
) -> Result<Json<UserResponse>, AppError> {
    let user = load_user(&app_state, user_id).await?;
    Ok(Json(user_response(&app_state, user).await?))
}

async fn update_user_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<i32>,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, AppError> {
    validate_quota(payload.traffic_limit, payload.traffic_reset_day)?;
    if let Some(status) = payload.status {
        if !matches!(status, UserStatus::Active | UserStatus::Disabled) {
            return Err(AppError::BadRequest(format!(
                "status {status} is derived and cannot be set"
            )));
        }
    }
    let username = match payload.username.map(|u| u.trim().to_string()) {
        Some(u) if u.is_empty() => return Err(AppError::BadRequest("username is required".to_string())),
        other => other,
    };
    let uuid = payload.uuid.as_deref().map(validate_uuid).transpose()?;

    let user = services::update_user(
        &app_state.db,
        user_id,
        UserChanges {
            username,
            uuid,
            traffic_limit: payload.traffic_limit,
            traffic_used: None,
            traffic_reset_day: payload.traffic_reset_day,
            expire_at: payload.expire_at,
            status: payload.status,
        },
    )
    .await?
    .ok_or_else(|| AppError::NotFound("user not found".to_string()))?;

    let response = user_response(&app_state, user).await?;
    app_state
        .orchestrator
        .spawn_sync_groups(response.group_ids.clone(), TriggerSource::AutoUserChange);
    Ok(Json(response))
}

async fn delete_user_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<i32>,
    Query(query): Query<DeleteUserQuery>,
) -> Result<Response, AppError> {
    let user = load_user(&app_state, user_id).await?;
    let group_ids = services::list_user_group_ids(&app_state.db, user.id).await?;

    let response = if query.hard {
        services::delete_user(&app_state.db, user.id).await?;
        Json(serde_json::json!({ "message": "user deleted" })).into_response()
    } else {
        let user = services::update_user(
            &app_state.db,
            user.id,
            UserChanges { status: Some(UserStatus::Disabled), ..Default::default() },
        )
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".to_string()))?;
        Json(user_response(&app_state, user).await?).into_response()
    };
    app_state
        .orchestrator
        .spawn_sync_groups(group_ids, TriggerSource::AutoUserChange);
    Ok(response)
}

async fn set_user_groups_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<i32>,
    Json(payload): Json<SetGroupsRequest>,
) -> Result<Json<UserResponse>, AppError> {
    let user = load_user(&app_state, user_id).await?;
    ensure_groups_exist(&app_state, &payload.group_ids).await?;
    let previous = services::set_user_groups(&app_state.db, user.id, &payload.group_ids).await?;

    let affected: BTreeSet<i32> = previous.into_iter().chain(payload.group_ids).collect();
    app_state.orchestrator.spawn_sync_groups(
        affected.into_iter().collect(),
        TriggerSource::AutoGroupMembershipChange,
    );
    Ok(Json(user_response(&app_state, user).await?))
}

async fn reset_traffic_handler(
    State(app_state): State<Arc<AppState>>,
    Path(user_id): Path<i32>,
) -> Result<Json<UserResponse>, AppError> {
    let user = services::reset_user_traffic(&app_state.db, user_id, Utc::now())
        .await?
        .ok_or_else(|| AppError::NotFound("user not found".to_string()))?;
    let response = user_response(&app_state, user).await?;
    app_state
        .orchestrator
        .spawn_sync_groups(response.group_ids.clone(), TriggerSource::AutoUserChange);
    Ok(Json(response))
}

pub fn create_user_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_users_handler).post(create_user_handler))
        .route(
            "/{id}",
            get(get_user_handler)
                .put(update_user_handler)
                .delete(delete_user_handler),
        )
        .route("/{id}/groups", put(set_user_groups_handler))
        .route("/{id}/reset-traffic", post(reset_traffic_handler))
}
