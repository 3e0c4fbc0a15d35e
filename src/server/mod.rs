//! HTTP and WebSocket front-ends.
//!
//! Two routes feed the same pipeline: `POST /eval` for request/reply and
//! `GET /socket` for the persistent bidirectional transport. `/health`
//! reports pool readiness.

pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod socket;
pub mod types;

use std::sync::Arc;

use axum::{Router, extract::DefaultBodyLimit, routing::get, routing::post};
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::error::{PotatError, Result};
use crate::pipeline::Pipeline;
use crate::worker::pool::WorkerPool;

use socket::SocketHub;

/// Request body cap for `POST /eval` (~20 MiB).
const MAX_BODY_BYTES: usize = 20 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pipeline: Pipeline,
    pub pool: Arc<WorkerPool>,
    pub hub: Arc<SocketHub>,
}

/// Build the router.
fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/eval", post(handlers::eval_handler))
        .route("/socket", get(socket::socket_handler))
        .route("/health", get(handlers::health_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the service: worker pool, pipeline, transports.
pub async fn run_server(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);

    let hub = Arc::new(SocketHub::new());
    let pool = Arc::new(WorkerPool::new(settings.clone(), hub.clone()));
    let pipeline = Pipeline::new(pool.clone(), settings.clone(), hub.clone());

    let state = Arc::new(AppState {
        settings: settings.clone(),
        pipeline,
        pool: pool.clone(),
        hub,
    });

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(PotatError::Io)?;

    tracing::info!(%addr, workers = settings.max_child_process_count, "potat-eval listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(PotatError::Io)?;

    tracing::info!("Server stopped, shutting down workers");
    pool.shutdown();

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
}
