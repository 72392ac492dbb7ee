use std::sync::Arc;

use axum::{middleware, routing::get, Router};

pub mod client;
pub mod config;
pub mod demo;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod server;
pub mod transport;

use server::ServerHandle;

#[derive(Clone)]
pub struct AppState {
    pub server: ServerHandle,
    pub ws_path: Arc<str>,
}

impl AppState {
    pub fn new(server: ServerHandle, ws_path: impl Into<String>) -> Self {
        Self {
            server,
            ws_path: Arc::<str>::from(ws_path.into()),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let app = Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .with_state(state.clone());

    state
        .server
        .attach(app, &state.ws_path)
        .layer(middleware::from_fn(logging::request_logging_middleware))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::client::WebSocketClient;
    use crate::errors::RpcError;
    use crate::mcp::registry::HandlerKind;
    use crate::server::WebSocketServer;

    use super::*;

    fn state() -> AppState {
        let mut server = WebSocketServer::new();
        demo::register_demo_handlers(&mut server).expect("register demo handlers");
        AppState::new(server.into_handle(), "/ws")
    }

    fn app() -> Router {
        build_app(state())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(Body::empty())
                    .expect("request build"),
            )
            .await
            .expect("request execution");

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn health_is_public() {
        let (status, body) = get_json(app(), "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn discovery_reports_endpoint_and_counts() {
        let (status, body) = get_json(app(), "/.well-known/mcp").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], json!(env!("CARGO_PKG_NAME")));
        assert_eq!(body["websocket_endpoint"], json!("/ws"));
        assert_eq!(body["tools"], json!(3));
        assert_eq!(body["resources"], json!(1));
        assert_eq!(body["prompts"], json!(1));
        assert_eq!(body["connections"], json!(0));
    }

    #[tokio::test]
    async fn root_get_is_not_found() {
        let (status, _) = get_json(app(), "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plain_get_on_websocket_path_is_rejected() {
        let (status, _) = get_json(app(), "/ws").await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn websocket_round_trip_over_loopback() {
        let state = state();
        let server = state.server.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, build_app(state).into_make_service())
                .await
                .expect("serve");
        });

        let client = WebSocketClient::connect(&format!("ws://{addr}/ws"))
            .await
            .expect("connect");

        let initialized = client.initialize().await.expect("initialize");
        assert_eq!(initialized["protocolVersion"], json!("2024-11-05"));

        let echoed = client
            .call_tool("example/echo", json!({"x": 1}))
            .await
            .expect("echo");
        assert_eq!(echoed, json!({"x": 1}));

        let err = client
            .call_tool("ghost", json!({}))
            .await
            .expect_err("ghost");
        assert!(matches!(err, RpcError::HandlerNotFound { kind: HandlerKind::Tool, .. }));

        let tools = client.list_tools().await.expect("list tools");
        assert!(tools.iter().any(|tool| tool.name == "example/slow"));

        let live = server.connections();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].path, "/ws");

        client.close().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while !server.connections().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection should be untracked after close");
    }
}
