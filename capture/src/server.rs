//! Local, read-only status server of the capture host.
//!
//! Routes:
//!   GET  /api/health      → status line, recording flag, uptime
//!   GET  /api/failed      → segment names that exhausted their uploads
//!   GET  /api/recordings  → settled segment files still in the spool

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use murmur_common::failed::FailedDeliverySet;
use murmur_common::protocol::{HealthResponse, SegmentInfo};
use murmur_common::storage;

use crate::controller::StatusHandle;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub status: StatusHandle,
    pub failed: Arc<FailedDeliverySet>,
    pub spool_dir: PathBuf,
    pub start_time: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/failed", get(list_failed))
        .route("/api/recordings", get(list_recordings))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind `listen_addr` and serve until `cancel` fires.
pub async fn run(
    listen_addr: &str,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Status server listening on {listen_addr}");
    serve(listener, state, cancel).await
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: state.status.status.borrow().clone(),
        recording: state.status.is_recording.load(Ordering::SeqCst),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn list_failed(State(state): State<AppState>) -> Result<Json<Vec<String>>, StatusCode> {
    match state.failed.names() {
        Ok(names) => Ok(Json(names.into_iter().collect())),
        Err(e) => {
            warn!("Cannot read failed set: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn list_recordings(State(state): State<AppState>) -> Json<Vec<SegmentInfo>> {
    Json(storage::list_segments(&state.spool_dir))
}
