//! Share links for a user's subscription.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use reqwest::Url;
use sea_orm::{DatabaseConnection, DbErr};
use serde_json::{json, Value};
use tracing::warn;

use crate::db::entities::{inbound, node, user};
use crate::db::services;
use crate::sync::payload::{is_ss2022, ss2022_server_key, ss2022_user_key};

fn advertised_host(node: &node::Model) -> String {
    let host = match node.public_address.trim() {
        "" => node.api_address.trim(),
        public => public,
    };
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn tls_server_name(inbound: &inbound::Model) -> Option<Option<String>> {
    let tls = inbound.tls_settings.as_ref()?;
    if tls.get("enabled").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    Some(tls.get("server_name").and_then(Value::as_str).map(str::to_string))
}

fn transport_field(inbound: &inbound::Model, key: &str) -> Option<String> {
    inbound
        .transport_settings
        .as_ref()
        .and_then(|t| t.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// `scheme://userinfo@host:port?params#name`. `None` if the pieces do not
/// form a valid URL.
fn url_link(
    scheme: &str,
    userinfo: &str,
    host: &str,
    port: i32,
    params: &[(&str, String)],
    name: &str,
) -> Option<String> {
    let mut url = Url::parse(&format!("{scheme}://{host}:{port}")).ok()?;
    url.set_username(userinfo).ok()?;
    if !params.is_empty() {
        let mut query = url.query_pairs_mut();
        for (key, value) in params {
            query.append_pair(key, value);
        }
    }
    url.set_fragment(Some(name));
    Some(url.to_string())
}

fn stream_params(inbound: &inbound::Model) -> Vec<(&'static str, String)> {
    let mut params = Vec::new();
    match tls_server_name(inbound) {
        Some(server_name) => {
            params.push(("security", "tls".to_string()));
            if let Some(sni) = server_name {
                params.push(("sni", sni));
            }
        }
        None => params.push(("security", "none".to_string())),
    }
    let network = transport_field(inbound, "type").unwrap_or_else(|| "tcp".to_string());
    params.push(("type", network));
    if let Some(path) = transport_field(inbound, "path") {
        params.push(("path", path));
    }
    if let Some(service) = transport_field(inbound, "service_name") {
        params.push(("serviceName", service));
    }
    params
}

/// One share link, or `None` for protocols without a client URL format.
pub fn share_link(node: &node::Model, inbound: &inbound::Model, user: &user::Model) -> Option<String> {
    let host = advertised_host(node);
    let port = inbound.advertised_port();
    let name = format!("{}-{}", node.name, inbound.tag);

    match inbound.protocol.as_str() {
        "vless" => {
            let mut params = vec![("encryption", "none".to_string())];
            if let Some(flow) = inbound.setting_str("flow") {
                params.push(("flow", flow.to_string()));
            }
            params.extend(stream_params(inbound));
            url_link("vless", &user.uuid, &host, port, &params, &name)
        }
        "trojan" => url_link("trojan", &user.uuid, &host, port, &stream_params(inbound), &name),
        "vmess" => {
            let tls = tls_server_name(inbound);
            let descriptor = json!({
                "v": "2",
                "ps": name,
                "add": host.trim_start_matches('[').trim_end_matches(']'),
                "port": port.to_string(),
                "id": user.uuid,
                "aid": "0",
                "net": transport_field(inbound, "type").unwrap_or_else(|| "tcp".to_string()),
                "type": "none",
                "path": transport_field(inbound, "path").unwrap_or_default(),
                "tls": if tls.is_some() { "tls" } else { "" },
                "sni": tls.flatten().unwrap_or_default(),
            });
            Some(format!("vmess://{}", STANDARD.encode(descriptor.to_string())))
        }
        "shadowsocks" => {
            let method = inbound.setting_str("method")?;
            let password = if is_ss2022(method) {
                let server = ss2022_server_key(inbound, method).ok()?;
                let user_key = ss2022_user_key(inbound, method, user).ok()?;
                format!("{server}:{user_key}")
            } else {
                user.uuid.clone()
            };
            let userinfo = URL_SAFE_NO_PAD.encode(format!("{method}:{password}"));
            url_link("ss", &userinfo, &host, port, &[], &name)
        }
        _ => None,
    }
}

/// Base64 of the newline-joined links for every inbound the user can reach,
/// ordered by node id then inbound id.
pub async fn render_subscription(db: &DatabaseConnection, user: &user::Model) -> Result<String, DbErr> {
    let group_ids = services::list_user_group_ids(db, user.id).await?;
    let nodes = services::list_nodes_in_groups(db, &group_ids).await?;

    let mut links = Vec::new();
    for node in &nodes {
        for inbound in services::list_inbounds(db, Some(node.id)).await? {
            match share_link(node, &inbound, user) {
                Some(link) => links.push(link),
                None => warn!(
                    node_id = node.id,
                    tag = %inbound.tag,
                    protocol = %inbound.protocol,
                    "No share link for inbound."
                ),
            }
        }
    }
    Ok(STANDARD.encode(links.join("\n")))
}
