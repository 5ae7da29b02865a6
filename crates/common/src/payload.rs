//! The configuration document pushed from the panel to `POST /api/config/sync`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

pub const DEFAULT_LISTEN: &str = "0.0.0.0";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("invalid payload: {0}")]
    Malformed(String),
    #[error("inbound #{index}: tag is required")]
    MissingTag { index: usize },
    #[error("inbound {tag}: type is required")]
    MissingType { tag: String },
    #[error("inbound {tag}: listen_port {port} out of range")]
    InvalidPort { tag: String, port: i64 },
    #[error("duplicate inbound tag: {0}")]
    DuplicateTag(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SyncPayload {
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
}

/// One listener. Protocol specific keys (`users`, `method`, `tls`,
/// `transport`, ...) are kept verbatim in `extra`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InboundConfig {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub listen_port: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

impl InboundConfig {
    pub fn new(kind: &str, tag: &str, listen_port: u16) -> Self {
        Self {
            kind: kind.to_string(),
            tag: tag.to_string(),
            listen: default_listen(),
            listen_port: i64::from(listen_port),
            extra: Map::new(),
        }
    }

    pub fn users_count(&self) -> usize {
        self.extra
            .get("users")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Port as a socket port. Only meaningful after [`SyncPayload::validate`].
    pub fn port(&self) -> u16 {
        u16::try_from(self.listen_port).unwrap_or(0)
    }
}

/// Secret-free projection of a payload. Two payloads that differ only in
/// passwords, uuids or keys project to the same summary.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PayloadSummary {
    pub inbound_count: usize,
    pub inbounds: Vec<InboundSummary>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct InboundSummary {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub listen_port: i64,
    pub users_count: usize,
}

impl SyncPayload {
    pub fn parse(bytes: &[u8]) -> Result<Self, PayloadError> {
        let payload: SyncPayload =
            serde_json::from_slice(bytes).map_err(|e| PayloadError::Malformed(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        let mut seen = HashSet::with_capacity(self.inbounds.len());
        for (index, inbound) in self.inbounds.iter().enumerate() {
            let tag = inbound.tag.trim();
            if tag.is_empty() {
                return Err(PayloadError::MissingTag { index });
            }
            if inbound.kind.trim().is_empty() {
                return Err(PayloadError::MissingType { tag: tag.to_string() });
            }
            if !(1..=65535).contains(&inbound.listen_port) {
                return Err(PayloadError::InvalidPort {
                    tag: tag.to_string(),
                    port: inbound.listen_port,
                });
            }
            if !seen.insert(tag) {
                return Err(PayloadError::DuplicateTag(tag.to_string()));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> PayloadSummary {
        let mut inbounds: Vec<InboundSummary> = self
            .inbounds
            .iter()
            .map(|inbound| InboundSummary {
                tag: inbound.tag.clone(),
                kind: inbound.kind.clone(),
                listen_port: inbound.listen_port,
                users_count: inbound.users_count(),
            })
            .collect();
        inbounds.sort_by(|a, b| a.tag.cmp(&b.tag));
        PayloadSummary {
            inbound_count: inbounds.len(),
            inbounds,
        }
    }

    /// SHA-256 over the canonical JSON of [`PayloadSummary`].
    pub fn payload_hash(&self) -> String {
        let canonical = serde_json::to_vec(&self.summary()).unwrap_or_default();
        crate::sha256_hex(&canonical)
    }

    /// SHA-256 over the full serialized payload, credentials and protocol
    /// settings included. Two payloads with equal digests configure a node
    /// identically.
    pub fn config_digest(&self) -> String {
        let rendered = serde_json::to_vec(self).unwrap_or_default();
        crate::sha256_hex(&rendered)
    }

    pub fn active_user_count(&self) -> usize {
        self.inbounds.iter().map(InboundConfig::users_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn parse_keeps_protocol_fields() {
        let raw = body(json!({
            "inbounds": [{
                "type": "vless",
                "tag": "vless-in",
                "listen_port": 443,
                "users": [{"name": "alice", "uuid": "a"}],
                "tls": {"enabled": true}
            }]
        }));
        let payload = SyncPayload::parse(&raw).unwrap();
        let inbound = &payload.inbounds[0];
        assert_eq!(inbound.listen, DEFAULT_LISTEN);
        assert_eq!(inbound.port(), 443);
        assert_eq!(inbound.users_count(), 1);
        assert_eq!(inbound.extra["tls"], json!({"enabled": true}));
    }

    #[test]
    fn reserialized_payload_keeps_tag_type_port() {
        let raw = body(json!({
            "inbounds": [
                {"type": "trojan", "tag": "b", "listen_port": 8443, "users": []},
                {"type": "socks", "tag": "a", "listen": "127.0.0.1", "listen_port": 1080}
            ]
        }));
        let first = SyncPayload::parse(&raw).unwrap();
        let again = SyncPayload::parse(&serde_json::to_vec(&first).unwrap()).unwrap();
        let triples = |p: &SyncPayload| {
            p.inbounds
                .iter()
                .map(|i| (i.tag.clone(), i.kind.clone(), i.listen_port))
                .collect::<Vec<_>>()
        };
        assert_eq!(triples(&first), triples(&again));
    }

    #[test]
    fn validation_rejects_bad_inbounds() {
        let missing_tag = body(json!({"inbounds": [{"type": "vless", "listen_port": 1}]}));
        assert_eq!(
            SyncPayload::parse(&missing_tag).unwrap_err(),
            PayloadError::MissingTag { index: 0 }
        );

        let missing_type = body(json!({"inbounds": [{"tag": "x", "listen_port": 1}]}));
        assert!(matches!(
            SyncPayload::parse(&missing_type).unwrap_err(),
            PayloadError::MissingType { .. }
        ));

        let zero_port = body(json!({"inbounds": [{"type": "vless", "tag": "x", "listen_port": 0}]}));
        assert!(matches!(
            SyncPayload::parse(&zero_port).unwrap_err(),
            PayloadError::InvalidPort { port: 0, .. }
        ));

        let high_port =
            body(json!({"inbounds": [{"type": "vless", "tag": "x", "listen_port": 65536}]}));
        assert!(matches!(
            SyncPayload::parse(&high_port).unwrap_err(),
            PayloadError::InvalidPort { port: 65536, .. }
        ));

        let duplicate = body(json!({"inbounds": [
            {"type": "vless", "tag": "x", "listen_port": 1},
            {"type": "vmess", "tag": "x", "listen_port": 2}
        ]}));
        assert_eq!(
            SyncPayload::parse(&duplicate).unwrap_err(),
            PayloadError::DuplicateTag("x".to_string())
        );

        assert!(matches!(
            SyncPayload::parse(b"[1,2]").unwrap_err(),
            PayloadError::Malformed(_)
        ));
    }

    #[test]
    fn empty_inbounds_are_valid() {
        let payload = SyncPayload::parse(br#"{"inbounds":[]}"#).unwrap();
        assert!(payload.inbounds.is_empty());
        assert_eq!(payload.summary().inbound_count, 0);
    }

    #[test]
    fn hash_ignores_credentials() {
        let a = SyncPayload::parse(&body(json!({"inbounds": [{
            "type": "vless", "tag": "v", "listen_port": 443,
            "users": [{"name": "alice", "uuid": "11111111-1111-1111-1111-111111111111"}]
        }]})))
        .unwrap();
        let b = SyncPayload::parse(&body(json!({"inbounds": [{
            "type": "vless", "tag": "v", "listen_port": 443,
            "users": [{"name": "alice", "uuid": "22222222-2222-2222-2222-222222222222"}]
        }]})))
        .unwrap();
        assert_eq!(a.payload_hash(), b.payload_hash());

        let c = SyncPayload::parse(&body(json!({"inbounds": [{
            "type": "vless", "tag": "v", "listen_port": 8443,
            "users": [{"name": "alice", "uuid": "22222222-2222-2222-2222-222222222222"}]
        }]})))
        .unwrap();
        assert_ne!(a.payload_hash(), c.payload_hash());
    }

    #[test]
    fn hash_is_order_independent() {
        let mut payload = SyncPayload::default();
        payload.inbounds.push(InboundConfig::new("vless", "a", 1));
        payload.inbounds.push(InboundConfig::new("trojan", "b", 2));
        let forward = payload.payload_hash();
        payload.inbounds.reverse();
        assert_eq!(forward, payload.payload_hash());
    }

    #[test]
    fn digest_covers_protocol_settings() {
        let plain = SyncPayload::parse(&body(json!({"inbounds": [{
            "type": "trojan", "tag": "t", "listen_port": 443,
            "users": [{"name": "alice", "password": "p"}]
        }]})))
        .unwrap();
        let with_tls = SyncPayload::parse(&body(json!({"inbounds": [{
            "type": "trojan", "tag": "t", "listen_port": 443,
            "users": [{"name": "alice", "password": "p"}],
            "tls": {"enabled": true, "server_name": "n1.example.com"}
        }]})))
        .unwrap();
        assert_eq!(plain.payload_hash(), with_tls.payload_hash());
        assert_ne!(plain.config_digest(), with_tls.config_digest());
        assert_eq!(plain.config_digest(), plain.clone().config_digest());
    }
}
