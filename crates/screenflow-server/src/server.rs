//! `ScreenflowServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use screenflow_engine::WorkflowEngine;
use screenflow_settings::ScreenflowSettings;

use crate::auth::Authenticator;
use crate::event_bridge::EventBridge;
use crate::gateway;
use crate::health::{self, HealthResponse};
use crate::metrics::{install_recorder, GATEWAY_REQUESTS_TOTAL, GATEWAY_REQUEST_DURATION_SECONDS};
use crate::presence::{spawn_sweeper, PresenceRegistry};
use crate::shutdown::ShutdownCoordinator;
use crate::ws;

/// Listener and presence tuning.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub request_timeout: Duration,
    pub ws_send_buffer: usize,
    pub presence_idle: Duration,
    pub presence_sweep: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ..Self::from(&ScreenflowSettings::default())
        }
    }
}

impl From<&ScreenflowSettings> for ServerConfig {
    fn from(s: &ScreenflowSettings) -> Self {
        Self {
            host: s.server.host.clone(),
            port: s.server.port,
            request_timeout: Duration::from_secs(s.server.request_timeout_secs.max(1)),
            ws_send_buffer: s.server.ws_send_buffer.max(1),
            presence_idle: Duration::from_secs(s.presence.idle_timeout_secs.max(1)),
            presence_sweep: Duration::from_secs(s.presence.sweep_interval_secs.max(1)),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
    pub presence: Arc<PresenceRegistry>,
    pub auth: Arc<dyn Authenticator>,
    pub metrics: PrometheusHandle,
    pub start_time: Instant,
    /// Cancelled when the server begins shutting down.
    pub shutdown: CancellationToken,
}

pub struct ScreenflowServer {
    config: ServerConfig,
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ScreenflowServer {
    pub fn new(config: ServerConfig, engine: WorkflowEngine, auth: Arc<dyn Authenticator>) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let state = AppState {
            engine,
            presence: Arc::new(PresenceRegistry::new(config.ws_send_buffer)),
            auth,
            metrics: install_recorder(),
            start_time: Instant::now(),
            shutdown: shutdown.token(),
        };
        Self {
            config,
            state,
            shutdown,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .merge(gateway::routes())
            .route("/ws", get(ws::ws_handler))
            .route_layer(middleware::from_fn(track_requests))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TimeoutLayer::new(self.config.request_timeout))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind, then serve in the background together with the event bridge
    /// and the presence sweep.
    pub async fn start(self) -> std::io::Result<ServerHandle> {
        let listener =
            tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.shutdown.token();

        let bridge = EventBridge::new(
            self.state.engine.subscribe(),
            self.state.presence.clone(),
            token.clone(),
        );
        self.shutdown.track(tokio::spawn(bridge.run()));
        self.shutdown.track(spawn_sweeper(
            self.state.presence.clone(),
            self.config.presence_sweep,
            self.config.presence_idle,
            token.clone(),
        ));
        self.shutdown.track(tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server stopped with error");
            }
        }));

        info!(%addr, "screenflow server listening");
        Ok(ServerHandle {
            addr,
            state: self.state,
            shutdown: self.shutdown,
            timeout: self.config.shutdown_timeout,
        })
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    state: AppState,
    shutdown: Arc<ShutdownCoordinator>,
    timeout: Duration,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting requests, close WebSockets and wait for background
    /// tasks.
    pub async fn shutdown(self) {
        info!("shutting down screenflow server");
        self.shutdown.graceful_shutdown(Some(self.timeout)).await;
    }
}

async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_owned());
    let started = Instant::now();
    let resp = next.run(req).await;
    counter!(
        GATEWAY_REQUESTS_TOTAL,
        "method" => method,
        "route" => route.clone(),
        "status" => resp.status().as_u16().to_string(),
    )
    .increment(1);
    histogram!(GATEWAY_REQUEST_DURATION_SECONDS, "route" => route)
        .record(started.elapsed().as_secs_f64());
    resp
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.presence.connection_count(),
        state.presence.room_count(),
        state.engine.active_actor_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use screenflow_core::ids::PatientId;
    use screenflow_engine::{EngineConfig, InMemoryPatientDirectory};
    use screenflow_settings::TokenGrant;
    use screenflow_store::Database;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::auth::StaticTokenAuthenticator;

    fn grant(token: &str, id: &str, role: &str) -> TokenGrant {
        TokenGrant {
            token: token.into(),
            participant_id: id.into(),
            name: id.into(),
            role: role.into(),
        }
    }

    fn make_server() -> ScreenflowServer {
        let engine = WorkflowEngine::new(
            Database::in_memory().unwrap(),
            Arc::new(InMemoryPatientDirectory::new([PatientId::from_raw("pat-1")])),
            EngineConfig::default(),
        );
        let auth = StaticTokenAuthenticator::from_grants(&[
            grant("t-clerk", "clerk-1", "registration_clerk"),
            grant("t-tech", "tech-1", "technician"),
        ])
        .unwrap();
        ScreenflowServer::new(ServerConfig::default(), engine, Arc::new(auth))
    }

    async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => req
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[test]
    fn config_from_settings() {
        let mut settings = ScreenflowSettings::default();
        settings.server.port = 9090;
        settings.presence.idle_timeout_secs = 45;
        let config = ServerConfig::from(&settings);
        assert_eq!(config.port, 9090);
        assert_eq!(config.presence_idle, Duration::from_secs(45));
        assert_eq!(ServerConfig::default().port, 0);
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = make_server().router();
        let (status, body) = call(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["connections"].is_number());
    }

    #[tokio::test]
    async fn metrics_endpoint_is_public() {
        let app = make_server().router();
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let app = make_server().router();
        let (status, body) = call(&app, Method::GET, "/sessions/wfs_x", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");

        let (status, _) = call(&app, Method::GET, "/sessions/wfs_x", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ws_without_token_is_401_before_upgrade() {
        let app = make_server().router();
        let (status, _) = call(&app, Method::GET, "/ws", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_then_read_session() {
        let app = make_server().router();
        let (status, created) = call(
            &app,
            Method::POST,
            "/sessions",
            Some("t-clerk"),
            Some(json!({"patient_id": "pat-1", "screening_type": "hospital_mobile_unit"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["current_step"], "registration");
        assert_eq!(created["workflow_steps"].as_array().unwrap().len(), 9);

        let id = created["session_id"].as_str().unwrap();
        let (status, fetched) = call(&app, Method::GET, &format!("/sessions/{id}"), Some("t-tech"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["session_id"], id);

        let (status, _) = call(
            &app,
            Method::POST,
            "/sessions",
            Some("t-clerk"),
            Some(json!({"patient_id": "pat-1", "screening_type": "hospital_mobile_unit"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn role_and_input_errors() {
        let app = make_server().router();
        let (status, _) = call(
            &app,
            Method::POST,
            "/sessions",
            Some("t-tech"),
            Some(json!({"patient_id": "pat-1", "screening_type": "school"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &app,
            Method::POST,
            "/sessions",
            Some("t-clerk"),
            Some(json!({"screening_type": "school"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "validation_error");

        let (status, _) = call(
            &app,
            Method::POST,
            "/sessions",
            Some("t-clerk"),
            Some(json!({"patient_id": "pat-1", "screening_type": "school", "initial_step": "prescription"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_step_name_is_404() {
        let app = make_server().router();
        let (_, created) = call(
            &app,
            Method::POST,
            "/sessions",
            Some("t-clerk"),
            Some(json!({"patient_id": "pat-1", "screening_type": "school"})),
        )
        .await;
        let id = created["session_id"].as_str().unwrap();
        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("/sessions/{id}/steps/teleport"),
            Some("t-clerk"),
            Some(json!({"complete_step": true})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_without_body_needs_supervisor() {
        let app = make_server().router();
        let (_, created) = call(
            &app,
            Method::POST,
            "/sessions",
            Some("t-clerk"),
            Some(json!({"patient_id": "pat-1", "screening_type": "school"})),
        )
        .await;
        let id = created["session_id"].as_str().unwrap();
        let (status, _) = call(&app, Method::POST, &format!("/sessions/{id}/cancel"), Some("t-clerk"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn activity_log_pages_newest_first() {
        let app = make_server().router();
        let (_, created) = call(
            &app,
            Method::POST,
            "/sessions",
            Some("t-clerk"),
            Some(json!({"patient_id": "pat-1", "screening_type": "school"})),
        )
        .await;
        let id = created["session_id"].as_str().unwrap();
        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("/sessions/{id}/steps/registration"),
            Some("t-clerk"),
            Some(json!({"complete_step": true, "comments": "checked in"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, page) = call(&app, Method::GET, &format!("/sessions/{id}/activity-logs"), Some("t-tech"), None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = page["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["action"], "completed");
        assert_eq!(entries[1]["action"], "created");

        let (_, page) = call(
            &app,
            Method::GET,
            &format!("/sessions/{id}/activity-logs?order=asc&action=completed"),
            Some("t-tech"),
            None,
        )
        .await;
        assert_eq!(page["entries"].as_array().unwrap().len(), 1);

        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/sessions/{id}/activity-logs?action=teleported"),
            Some("t-tech"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
