//! The node's HTTP surface.

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;

use crate::runtime::Runtime;
use crate::sampler::InterfaceSampler;
use crate::tracker::InboundTracker;

pub mod error;
pub mod middleware;
pub mod routes;

pub struct AppState {
    pub secret_key: String,
    pub state_path: PathBuf,
    pub traffic_interface: String,
    pub runtime: Arc<Runtime>,
    pub tracker: Arc<InboundTracker>,
    pub sampler: InterfaceSampler,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/config/sync", post(routes::sync_config))
        .route("/stats/traffic", get(routes::interface_traffic))
        .route("/stats/inbounds", get(routes::inbound_traffic))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth,
        ));

    let api = Router::new()
        .route("/health", get(routes::health))
        .merge(protected);

    Router::new().nest("/api", api).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ListenerEngineFactory;
    use crate::tracker::ConnMetadata;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use proxyfleet_common::{sha256_hex, InboundTrafficReport, InterfaceSample};
    use serde_json::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tower::ServiceExt;

    const SECRET: &str = "node-secret";

    struct Harness {
        _dir: tempfile::TempDir,
        state: Arc<AppState>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("route"), "Iface\tDestination\tGateway\tFlags\n").unwrap();
        std::fs::write(
            dir.path().join("dev"),
            "Inter-|\n face |\n  eth9: 10 1 0 0 0 0 0 0 20 2 0 0 0 0 0 0\n",
        )
        .unwrap();
        let tracker = Arc::new(InboundTracker::new());
        let state = Arc::new(AppState {
            secret_key: SECRET.to_string(),
            state_path: dir.path().join("state/last_config.json"),
            traffic_interface: "eth9".to_string(),
            runtime: Arc::new(Runtime::new(Arc::new(ListenerEngineFactory), tracker.clone())),
            tracker,
            sampler: InterfaceSampler::new(dir.path().join("route"), dir.path().join("dev")),
        });
        Harness { _dir: dir, state }
    }

    fn authed(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {SECRET}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    async fn free_port() -> u16 {
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        free.local_addr().unwrap().port()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let h = harness();
        let response = create_router(h.state.clone())
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn protected_routes_need_the_secret() {
        let h = harness();
        for token in [None, Some("Bearer wrong"), Some(SECRET)] {
            let mut builder = Request::get("/api/stats/inbounds");
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, token);
            }
            let response = create_router(h.state.clone())
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(
                body_json(response).await,
                serde_json::json!({"error": "unauthorized"})
            );
        }
    }

    #[tokio::test]
    async fn applying_the_same_body_twice_is_stable() {
        let h = harness();
        let port = free_port().await;
        let body = format!(
            r#"{{"inbounds":[{{"type":"vless","tag":"vless-in","listen":"127.0.0.1","listen_port":{port},"users":[]}}]}}"#
        );

        for _ in 0..2 {
            let response = create_router(h.state.clone())
                .oneshot(authed("POST", "/api/config/sync", Body::from(body.clone())))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_json(response).await, serde_json::json!({"status": "ok"}));
            assert_eq!(std::fs::read(&h.state.state_path).unwrap(), body.as_bytes());
            assert_eq!(
                h.state.runtime.last_applied().unwrap().hash,
                sha256_hex(body.as_bytes())
            );
        }
        h.state.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_payload_is_bad_request() {
        let h = harness();
        let cases = [
            r#"{"inbounds":[{"type":"vless","listen_port":1000}]}"#,
            r#"{"inbounds":[{"type":"vless","tag":"a","listen_port":0}]}"#,
            r#"{"inbounds":[{"type":"vless","tag":"a","listen_port":1000},{"type":"vmess","tag":"a","listen_port":1001}]}"#,
            "not json",
        ];
        for case in cases {
            let response = create_router(h.state.clone())
                .oneshot(authed("POST", "/api/config/sync", Body::from(case)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{case}");
        }
        assert!(!h.state.state_path.exists());
    }

    #[tokio::test]
    async fn apply_failure_is_plain_text_500() {
        let h = harness();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let body = format!(
            r#"{{"inbounds":[{{"type":"trojan","tag":"t1","listen":"127.0.0.1","listen_port":{port}}}]}}"#
        );
        let response = create_router(h.state.clone())
            .oneshot(authed("POST", "/api/config/sync", Body::from(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let text = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(text.to_vec()).unwrap();
        assert!(text.starts_with("create inbound (tag=t1 type=trojan):"), "{text}");
        assert!(!h.state.state_path.exists());
    }

    #[tokio::test]
    async fn inbound_stats_reset_zeroes_counters() {
        let h = harness();
        let (mut client, server) = tokio::io::duplex(64);
        let mut tracked = h
            .state
            .tracker
            .wrap_stream(server, &ConnMetadata::new("vless-in", "alice"));
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tracked.read_exact(&mut buf).await.unwrap();

        let response = create_router(h.state.clone())
            .oneshot(authed("GET", "/api/stats/inbounds?reset=true", Body::empty()))
            .await
            .unwrap();
        let report: InboundTrafficReport =
            serde_json::from_value(body_json(response).await).unwrap();
        assert!(report.reset);
        assert_eq!(report.data.len(), 1);
        assert_eq!(report.data[0].uplink, 4);
        assert_eq!(report.meta.unwrap().tcp_conns, 1);

        let response = create_router(h.state.clone())
            .oneshot(authed("GET", "/api/stats/inbounds", Body::empty()))
            .await
            .unwrap();
        let report: InboundTrafficReport =
            serde_json::from_value(body_json(response).await).unwrap();
        assert!(!report.reset);
        assert_eq!(report.data[0].uplink, 0);
    }

    #[tokio::test]
    async fn interface_stats_use_configured_interface() {
        let h = harness();
        let response = create_router(h.state.clone())
            .oneshot(authed("GET", "/api/stats/traffic", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let sample: InterfaceSample = serde_json::from_value(body_json(response).await).unwrap();
        assert_eq!(sample.interface, "eth9");
        assert_eq!((sample.rx_bytes, sample.tx_bytes), (10, 20));

        let response = create_router(h.state.clone())
            .oneshot(authed("GET", "/api/stats/traffic?interface=missing0", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
