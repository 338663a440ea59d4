use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::info;

use crate::device::{ControlStatus, DeviceCore};
use crate::diagnostics::DiagnosticsReport;
use crate::error::{ErrorKind, SessionError};
use crate::models::{ConnectionState, EventKind, SessionData};
use crate::scheduler::SchedulerPhase;

type AppState = Arc<DeviceCore>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    #[serde(flatten)]
    pub state: ConnectionState,
    pub phase: SchedulerPhase,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_active: bool,
    pub current: Option<SessionData>,
    pub last: Option<SessionData>,
}

#[derive(Debug, Deserialize)]
pub struct AlertRequest {
    pub kind: EventKind,
    pub title: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Deserialize)]
pub struct FailureRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
}

pub struct ApiError(SessionError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (StatusCode::CONFLICT, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

pub async fn get_connection(State(core): State<AppState>) -> Json<ConnectionView> {
    Json(ConnectionView {
        state: core.connection_state(),
        phase: core.phase(),
    })
}

pub async fn get_control(State(core): State<AppState>) -> Json<ControlStatus> {
    Json(core.control_status())
}

pub async fn get_session(State(core): State<AppState>) -> Json<SessionView> {
    let sessions = core.sessions();
    Json(SessionView {
        session_active: sessions.is_active(),
        current: sessions.current(),
        last: sessions.last_session(),
    })
}

pub async fn start_session(State(core): State<AppState>) -> Result<Json<SessionData>, ApiError> {
    Ok(Json(core.start_session()?))
}

pub async fn end_session(State(core): State<AppState>) -> Result<Json<SessionData>, ApiError> {
    Ok(Json(core.end_session()?))
}

pub async fn add_alert(
    State(core): State<AppState>,
    Json(alert): Json<AlertRequest>,
) -> Json<serde_json::Value> {
    let recorded = core.add_session_alert(alert.kind, &alert.title, &alert.detail);
    Json(serde_json::json!({ "recorded": recorded }))
}

pub async fn refresh(State(core): State<AppState>) -> Json<serde_json::Value> {
    let connected = core.refresh_connection().await;
    Json(serde_json::json!({ "connected": connected }))
}

pub async fn command_failure(
    State(core): State<AppState>,
    Json(failure): Json<FailureRequest>,
) -> StatusCode {
    core.report_command_failure(&failure.reason);
    StatusCode::ACCEPTED
}

pub async fn get_diagnostics(State(core): State<AppState>) -> Json<DiagnosticsReport> {
    Json(core.diagnostics())
}

pub fn create_router(core: AppState, dashboard_dir: &Path) -> Router {
    Router::new()
        .route("/api/connection", get(get_connection))
        .route("/api/control", get(get_control))
        .route("/api/control/failure", post(command_failure))
        .route("/api/session", get(get_session))
        .route("/api/session/start", post(start_session))
        .route("/api/session/end", post(end_session))
        .route("/api/session/alerts", post(add_alert))
        .route("/api/refresh", post(refresh))
        .route("/api/diagnostics", get(get_diagnostics))
        .fallback_service(ServeDir::new(dashboard_dir))
        .with_state(core)
}

pub async fn start_server(port: u16, dashboard_dir: &Path, core: AppState) -> anyhow::Result<()> {
    let app = create_router(core, dashboard_dir);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("API: http://localhost:{}", addr.port());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
