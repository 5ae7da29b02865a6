use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use sea_orm::DatabaseConnection;
use tracing::{info, warn};

use crate::db::entities::admin;
use crate::db::services as db_services;
use crate::web::error::AppError;
use crate::web::models::{Claims, LoginRequest, LoginResponse, SetupRequest};

const TOKEN_TTL_HOURS: i64 = 24;
const MIN_PASSWORD_LEN: usize = 8;
const HASH_COST: u32 = if cfg!(test) { 4 } else { DEFAULT_COST };

fn hash_password(password: &str) -> Result<String, AppError> {
    hash(password, HASH_COST).map_err(|e| AppError::Internal(format!("password hashing failed: {e}")))
}

pub async fn login(
    db: &DatabaseConnection,
    req: LoginRequest,
    jwt_secret: &str,
) -> Result<LoginResponse, AppError> {
    if req.username.is_empty() || req.password.is_empty() {
        return Err(AppError::BadRequest("username and password are required".to_string()));
    }
    let invalid = || AppError::Unauthorized("invalid credentials".to_string());

    let admin = db_services::find_admin_by_username(db, &req.username)
        .await?
        .ok_or_else(invalid)?;
    let valid = verify(&req.password, &admin.password_hash)
        .map_err(|e| AppError::Internal(format!("password verification failed: {e}")))?;
    if !valid {
        warn!(username = %req.username, "Rejected login with wrong password.");
        return Err(invalid());
    }
    create_token(&admin, jwt_secret)
}

/// Creates the first admin. Only possible while no admin exists and with
/// the configured setup token.
pub async fn setup_admin(
    db: &DatabaseConnection,
    req: SetupRequest,
    setup_token: Option<&str>,
    jwt_secret: &str,
) -> Result<LoginResponse, AppError> {
    let Some(expected) = setup_token else {
        return Err(AppError::NotFound("setup is disabled".to_string()));
    };
    if db_services::count_admins(db).await? > 0 {
        return Err(AppError::Conflict("an admin already exists".to_string()));
    }
    if req.token != expected {
        return Err(AppError::Unauthorized("invalid setup token".to_string()));
    }
    if req.username.trim().is_empty() || req.password.len() < MIN_PASSWORD_LEN {
        return Err(AppError::BadRequest(format!(
            "username is required and the password needs at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let admin =
        db_services::create_admin(db, req.username.trim(), &hash_password(&req.password)?).await?;
    info!(username = %admin.username, "Admin created through setup.");
    create_token(&admin, jwt_secret)
}

/// Creates the configured admin when the store has none yet.
pub async fn seed_admin(
    db: &DatabaseConnection,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<bool, AppError> {
    let (Some(username), Some(password)) = (username, password) else {
        return Ok(false);
    };
    if db_services::count_admins(db).await? > 0 {
        return Ok(false);
    }
    db_services::create_admin(db, username, &hash_password(password)?).await?;
    info!(username, "Seeded admin account.");
    Ok(true)
}

pub fn create_token(admin: &admin::Model, jwt_secret: &str) -> Result<LoginResponse, AppError> {
    let expiration = (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).timestamp() as usize;
    let claims = Claims {
        sub: admin.username.clone(),
        admin_id: admin.id,
        exp: expiration,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_ref()),
    )
    .map_err(|e| AppError::Internal(format!("token creation failed: {e}")))?;

    Ok(LoginResponse {
        token,
        admin_id: admin.id,
        username: admin.username.clone(),
    })
}

pub fn decode_token(token: &str, jwt_secret: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_ref()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| {
        warn!(error = ?e, "JWT decoding error during auth middleware.");
        AppError::Unauthorized("unauthorized".to_string())
    })
}
