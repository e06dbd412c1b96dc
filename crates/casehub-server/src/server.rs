//! `CasehubServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use casehub_hub::Hub;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{SessionParams, run_ws_session};

/// Header carrying the identity verified by the authenticating gateway.
pub const USER_HEADER: &str = "x-user-email";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The hub sessions attach to.
    pub hub: Arc<Hub>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`, if a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

/// The casehub server.
pub struct CasehubServer {
    config: Arc<ServerConfig>,
    hub: Arc<Hub>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl CasehubServer {
    /// Create a server around `hub`.
    pub fn new(config: ServerConfig, hub: Arc<Hub>) -> Self {
        Self {
            config: Arc::new(config),
            hub,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/cases/{case_id}/ws", get(ws_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind, start the hub's background tasks and serve until shutdown.
    ///
    /// Returns the bound address and the serving task. After
    /// [`ShutdownCoordinator::shutdown`] the hub closes every connection and
    /// drains its background tasks before the task finishes.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let tasks = self.hub.start();
        let router = self.router();

        let hub = self.hub.clone();
        let shutdown = self.shutdown.clone();
        let token = shutdown.token();
        let drain = {
            let hub = hub.clone();
            async move {
                token.cancelled().await;
                let report = shutdown.graceful_shutdown(&hub, tasks, None).await;
                info!(
                    connections = report.connections_closed,
                    tasks = report.tasks,
                    timed_out = report.timed_out,
                    "hub drained"
                );
            }
        };

        info!(%addr, "casehub server listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(drain).await {
                error!(error = %e, "server terminated with error");
                hub.shutdown();
            }
            info!("casehub server stopped");
        });
        Ok((addr, handle))
    }

    /// The hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.connection_count(),
        state.hub.group_count(),
        state.shutdown.is_shutting_down() || state.hub.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(&handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Query parameters of the upgrade route.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Group to join right after registration.
    #[serde(rename = "groupId")]
    pub group_id: Option<String>,
}

/// GET /cases/{case_id}/ws
///
/// Identity and group are validated before the upgrade, so a rejected
/// request never reaches the registry.
async fn ws_handler(
    State(state): State<AppState>,
    Path(case_id): Path<String>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(user) = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    else {
        return (StatusCode::UNAUTHORIZED, "missing user identity").into_response();
    };
    let Some(group_id) = params.group_id.filter(|g| !g.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, "groupId query parameter is required").into_response();
    };
    if state.hub.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let session = SessionParams {
        user: user.into(),
        case_id: case_id.into(),
        group_id: group_id.into(),
        write_timeout: state.config.write_timeout(),
    };
    let hub = state.hub.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| run_ws_session(socket, session, hub))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use casehub_hub::{HubConfig, MemoryMessageStore};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server() -> CasehubServer {
        let hub = Arc::new(Hub::new(
            HubConfig::default(),
            Arc::new(MemoryMessageStore::new()),
        ));
        CasehubServer::new(ServerConfig::default(), hub)
    }

    async fn get(app: Router, uri: &str, user: Option<&str>) -> Response {
        let mut req = Request::builder().uri(uri);
        if let Some(user) = user {
            req = req.header(USER_HEADER, user);
        }
        app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_reports_counters() {
        let server = make_server();
        let _conn = server.hub().register("a".into(), "C1".into());
        server
            .hub()
            .join(&"a".into(), &"G1".into(), &"C1".into())
            .unwrap();

        let resp = get(server.router(), "/health", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 1);
        assert_eq!(parsed["groups"], 1);
        assert!(parsed["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn health_reports_shutdown() {
        let server = make_server();
        server.shutdown().shutdown();
        let parsed = body_json(get(server.router(), "/health", None).await).await;
        assert_eq!(parsed["status"], "shutting_down");
    }

    #[tokio::test]
    async fn ws_without_identity_is_unauthorized() {
        let server = make_server();
        let resp = get(server.router(), "/cases/C1/ws?groupId=G1", None).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let resp = get(server.router(), "/cases/C1/ws?groupId=G1", Some("  ")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(server.hub().connection_count(), 0);
    }

    #[tokio::test]
    async fn ws_without_group_is_bad_request() {
        let server = make_server();
        let resp = get(server.router(), "/cases/C1/ws", Some("a@x.io")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = get(server.router(), "/cases/C1/ws?groupId=", Some("a@x.io")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_rejected() {
        let server = make_server();
        let resp = get(server.router(), "/cases/C1/ws?groupId=G1", Some("a@x.io")).await;
        assert!(resp.status().is_client_error());
        assert_eq!(server.hub().connection_count(), 0);
    }

    #[tokio::test]
    async fn ws_refused_during_shutdown() {
        let server = make_server();
        server.hub().shutdown();
        let resp = get(server.router(), "/cases/C1/ws?groupId=G1", Some("a@x.io")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_disabled_returns_404() {
        let server = make_server();
        let resp = get(server.router(), "/metrics", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_enabled_renders_text() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let server = make_server().with_metrics(handle);
        let resp = get(server.router(), "/metrics", None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let server = make_server();
        let resp = get(server.router(), "/nonexistent", None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server();
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(server.hub().is_shutting_down());
    }
}
