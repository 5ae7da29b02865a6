//! Derives the configuration a node must run from the panel's store.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use proxyfleet_common::{InboundConfig, PayloadError, SyncPayload, DEFAULT_LISTEN};
use sea_orm::{DatabaseConnection, DbErr};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::db::entities::{inbound, node, user};
use crate::db::services;

pub const SUPPORTED_PROTOCOLS: [&str; 7] =
    ["vless", "vmess", "trojan", "shadowsocks", "socks", "http", "mixed"];

// Keys owned by the payload itself; inbound settings never override them.
const RESERVED_KEYS: [&str; 5] = ["type", "tag", "listen", "listen_port", "users"];

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("node {0} has no group")]
    NoGroup(i32),
    #[error("inbound {id}: tag is required")]
    MissingTag { id: i32 },
    #[error("duplicate inbound tag: {0}")]
    DuplicateTag(String),
    #[error("inbound {tag}: unsupported protocol {protocol}")]
    UnsupportedProtocol { tag: String, protocol: String },
    #[error("inbound {tag}: method {method}: password required")]
    PasswordRequired { tag: String, method: String },
    #[error(transparent)]
    Invalid(#[from] PayloadError),
    #[error(transparent)]
    Db(#[from] DbErr),
}

impl BuildError {
    /// Caused by stored configuration rather than the store itself.
    pub fn is_bad_request(&self) -> bool {
        !matches!(self, BuildError::Db(_))
    }
}

pub fn is_ss2022(method: &str) -> bool {
    method.starts_with("2022-blake3-")
}

/// Key for a Shadowsocks 2022 method, derived from a uuid.
///
/// `aes-128` takes the 16 uuid bytes, the 32-byte methods take their
/// SHA-256. `None` for other methods or a malformed uuid.
pub fn ss2022_key(method: &str, uuid: &str) -> Option<String> {
    let raw = Uuid::parse_str(uuid).ok()?;
    match method {
        "2022-blake3-aes-128-gcm" => Some(STANDARD.encode(raw.as_bytes())),
        "2022-blake3-aes-256-gcm" | "2022-blake3-chacha20-poly1305" => {
            Some(STANDARD.encode(Sha256::digest(raw.as_bytes())))
        }
        _ => None,
    }
}

/// Server PSK of a 2022 inbound: the explicit `password` setting, else
/// derived from the inbound uuid.
pub fn ss2022_server_key(inbound: &inbound::Model, method: &str) -> Result<String, BuildError> {
    if let Some(password) = inbound.setting_str("password") {
        return Ok(password.to_string());
    }
    ss2022_key(method, &inbound.uuid).ok_or_else(|| BuildError::PasswordRequired {
        tag: inbound.tag.clone(),
        method: method.to_string(),
    })
}

pub fn ss2022_user_key(
    inbound: &inbound::Model,
    method: &str,
    user: &user::Model,
) -> Result<String, BuildError> {
    ss2022_key(method, &user.uuid).ok_or_else(|| BuildError::PasswordRequired {
        tag: inbound.tag.clone(),
        method: method.to_string(),
    })
}

/// Payload for `node`: its inbounds with the active users of its group.
pub async fn build_node_payload(
    db: &DatabaseConnection,
    node: &node::Model,
) -> Result<SyncPayload, BuildError> {
    let group_id = node.group_id.ok_or(BuildError::NoGroup(node.id))?;
    let inbounds = services::list_inbounds(db, Some(node.id)).await?;
    let users = services::list_active_users_for_group(db, group_id, Utc::now()).await?;
    build_payload(&inbounds, &users)
}

pub fn build_payload(
    inbounds: &[inbound::Model],
    users: &[user::Model],
) -> Result<SyncPayload, BuildError> {
    let mut seen = HashSet::with_capacity(inbounds.len());
    let mut rendered = Vec::with_capacity(inbounds.len());
    for inbound in inbounds {
        if inbound.tag.trim().is_empty() {
            return Err(BuildError::MissingTag { id: inbound.id });
        }
        if !seen.insert(inbound.tag.as_str()) {
            return Err(BuildError::DuplicateTag(inbound.tag.clone()));
        }
        rendered.push(render_inbound(inbound, users)?);
    }
    let payload = SyncPayload { inbounds: rendered };
    payload.validate()?;
    Ok(payload)
}

fn render_inbound(
    inbound: &inbound::Model,
    users: &[user::Model],
) -> Result<InboundConfig, BuildError> {
    let protocol = inbound.protocol.as_str();
    let mut extra = Map::new();
    if let Some(settings) = inbound.settings.as_object() {
        for (key, value) in settings {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            // Moved onto each user below.
            if key == "flow" && matches!(protocol, "vless" | "vmess") {
                continue;
            }
            extra.insert(key.clone(), value.clone());
        }
    }

    let rendered_users: Vec<Value> = match protocol {
        "vless" | "vmess" => {
            let flow = inbound.setting_str("flow");
            users
                .iter()
                .map(|u| {
                    let mut entry = json!({ "name": u.username, "uuid": u.uuid });
                    if let Some(flow) = flow {
                        entry["flow"] = Value::String(flow.to_string());
                    }
                    entry
                })
                .collect()
        }
        "trojan" => users
            .iter()
            .map(|u| json!({ "name": u.username, "password": u.uuid }))
            .collect(),
        "shadowsocks" => {
            let method = inbound.setting_str("method").unwrap_or_default();
            if is_ss2022(method) {
                let server_key = ss2022_server_key(inbound, method)?;
                extra.insert("password".to_string(), Value::String(server_key));
                users
                    .iter()
                    .map(|u| {
                        ss2022_user_key(inbound, method, u)
                            .map(|key| json!({ "name": u.username, "password": key }))
                    })
                    .collect::<Result<_, _>>()?
            } else {
                users
                    .iter()
                    .map(|u| json!({ "name": u.username, "password": u.uuid }))
                    .collect()
            }
        }
        "socks" | "http" | "mixed" => users
            .iter()
            .map(|u| json!({ "username": u.username, "password": u.uuid }))
            .collect(),
        other => {
            return Err(BuildError::UnsupportedProtocol {
                tag: inbound.tag.clone(),
                protocol: other.to_string(),
            })
        }
    };
    extra.insert("users".to_string(), Value::Array(rendered_users));

    if let Some(tls) = inbound.tls_settings.as_ref().filter(|v| !v.is_null()) {
        extra.insert("tls".to_string(), tls.clone());
    }
    if let Some(transport) = inbound.transport_settings.as_ref().filter(|v| !v.is_null()) {
        extra.insert("transport".to_string(), transport.clone());
    }

    Ok(InboundConfig {
        kind: inbound.protocol.clone(),
        tag: inbound.tag.clone(),
        listen: DEFAULT_LISTEN.to_string(),
        listen_port: i64::from(inbound.listen_port),
        extra,
    })
}
