use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::guard::{CascadeReport, DiagnosticConsole};

type SharedState = Arc<AppState>;

#[derive(Debug, Clone)]
pub struct AppState {
    pub console: DiagnosticConsole,
}

impl AppState {
    pub fn new(console: DiagnosticConsole) -> Self {
        Self { console }
    }
}

#[derive(Debug, Deserialize)]
pub struct ObserveRequest {
    pub subject_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SignOutResponse {
    pub performed: bool,
    pub report: Option<CascadeReport>,
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn state_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.console.snapshot().await)
}

async fn check_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let result = state.console.check_now().await;
    debug!(result = ?result, "diagnostic check finished");
    Json(result)
}

async fn signout_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let report = state.console.force_sign_out_now().await;
    let status = if report.is_some() {
        StatusCode::OK
    } else {
        // Collapsed into a cascade that already ran or is running.
        StatusCode::ACCEPTED
    };
    (
        status,
        Json(SignOutResponse {
            performed: report.is_some(),
            report,
        }),
    )
}

async fn consistency_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.console.report_consistency().await)
}

async fn observe_handler(
    State(state): State<SharedState>,
    Json(req): Json<ObserveRequest>,
) -> impl IntoResponse {
    let subject = req.subject_id.as_deref().filter(|s| !s.is_empty());
    Json(state.console.observe(subject).await)
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/diagnostics/state", get(state_handler))
        .route("/diagnostics/check", post(check_handler))
        .route("/diagnostics/signout", post(signout_handler))
        .route("/diagnostics/consistency", get(consistency_handler))
        .route("/diagnostics/observe", post(observe_handler))
        .with_state(state)
}

/// Serve the diagnostic console on loopback only.
pub async fn serve(console: DiagnosticConsole, port: u16) -> Result<()> {
    let state = Arc::new(AppState::new(console));
    let app = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("diagnostic API listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}
