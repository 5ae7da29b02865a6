//! HTTP client for the node agents.

use async_trait::async_trait;
use proxyfleet_common::{InboundTrafficReport, InterfaceSample, SyncPayload};
use reqwest::{Client, RequestBuilder};
use std::time::Duration;
use thiserror::Error;

use crate::db::entities::node;

pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeClientError {
    /// Connect, TLS, timeout or body read failures.
    #[error("node sync request failed: {0}")]
    Request(String),
    #[error("node sync status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("node response decode failed: {0}")]
    Decode(String),
    #[error("node sync cancelled")]
    Cancelled,
}

impl NodeClientError {
    /// Only transport failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeClientError::Request(_))
    }

    /// Status code returned by the node, 0 when none was received.
    pub fn http_status(&self) -> i32 {
        match self {
            NodeClientError::Status { status, .. } => i32::from(*status),
            _ => 0,
        }
    }
}

impl From<reqwest::Error> for NodeClientError {
    fn from(err: reqwest::Error) -> Self {
        NodeClientError::Request(err.to_string())
    }
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn health(&self, node: &node::Model) -> Result<(), NodeClientError>;
    async fn push_config(&self, node: &node::Model, payload: &SyncPayload) -> Result<(), NodeClientError>;
    async fn interface_traffic(
        &self,
        node: &node::Model,
        interface: Option<&str>,
    ) -> Result<InterfaceSample, NodeClientError>;
    async fn inbound_traffic(
        &self,
        node: &node::Model,
        reset: bool,
    ) -> Result<InboundTrafficReport, NodeClientError>;
}

pub struct HttpNodeClient {
    client: Client,
}

impl HttpNodeClient {
    /// `timeout` bounds every request except health checks.
    pub fn new(timeout: Duration) -> Result<Self, NodeClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn authed(&self, builder: RequestBuilder, node: &node::Model) -> RequestBuilder {
        builder.bearer_auth(&node.secret_key)
    }

    async fn send(builder: RequestBuilder) -> Result<reqwest::Response, NodeClientError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(NodeClientError::Status {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, NodeClientError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| NodeClientError::Decode(e.to_string()))
    }
}

#[async_trait]
impl NodeApi for HttpNodeClient {
    async fn health(&self, node: &node::Model) -> Result<(), NodeClientError> {
        let url = format!("{}/api/health", node.base_url());
        Self::send(self.client.get(url).timeout(HEALTH_TIMEOUT)).await?;
        Ok(())
    }

    async fn push_config(&self, node: &node::Model, payload: &SyncPayload) -> Result<(), NodeClientError> {
        let url = format!("{}/api/config/sync", node.base_url());
        let body = serde_json::to_vec(payload).map_err(|e| NodeClientError::Decode(e.to_string()))?;
        let request = self
            .authed(self.client.post(url), node)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        Self::send(request).await?;
        Ok(())
    }

    async fn interface_traffic(
        &self,
        node: &node::Model,
        interface: Option<&str>,
    ) -> Result<InterfaceSample, NodeClientError> {
        let url = format!("{}/api/stats/traffic", node.base_url());
        let mut request = self.authed(self.client.get(url), node);
        if let Some(interface) = interface.filter(|i| !i.is_empty()) {
            request = request.query(&[("interface", interface)]);
        }
        Self::decode(Self::send(request).await?).await
    }

    async fn inbound_traffic(
        &self,
        node: &node::Model,
        reset: bool,
    ) -> Result<InboundTrafficReport, NodeClientError> {
        let url = format!("{}/api/stats/inbounds", node.base_url());
        let mut request = self.authed(self.client.get(url), node);
        if reset {
            request = request.query(&[("reset", "1")]);
        }
        Self::decode(Self::send(request).await?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_transport_only() {
        let transport = NodeClientError::Request("connection refused".into());
        assert!(transport.is_transient());
        assert!(transport.to_string().starts_with("node sync request failed:"));
        assert_eq!(transport.http_status(), 0);

        let status = NodeClientError::Status { status: 500, body: "boom".into() };
        assert!(!status.is_transient());
        assert_eq!(status.to_string(), "node sync status 500: boom");
        assert_eq!(status.http_status(), 500);
    }
}
