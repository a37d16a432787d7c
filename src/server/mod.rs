// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP API for the download manager.
//!
//! Endpoints:
//! - POST /api/downloads - Create a download job
//! - GET /api/downloads - List jobs, newest first
//! - DELETE /api/downloads/completed - Drop finished jobs
//! - GET /api/downloads/:id - One job
//! - POST /api/downloads/:id/cancel - Cancel a running job
//! - POST /api/downloads/:id/retry - Retry a failed or cancelled job
//! - GET /api/downloads/:id/events - Server-sent job updates
//! - GET /health - Health check

use std::convert::Infallible;
use std::future::ready;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;

use crate::config::DEFAULT_PORT;
use crate::download::{CreateJobOptions, Job, JobManager, Subscription};
use crate::errors::{ApiError, ApiResult};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state for request handlers.
pub struct AppState {
    pub manager: JobManager,
}

/// Body of `POST /api/downloads`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDownloadRequest {
    pub url: String,
    #[serde(flatten)]
    pub options: CreateJobOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub removed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub jobs: usize,
}

/// The API server.
pub struct Server {
    port: u16,
    bind_address: String,
    manager: JobManager,
}

impl Server {
    pub fn new(manager: JobManager) -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_address: "127.0.0.1".to_string(),
            manager,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use "0.0.0.0" to listen on all interfaces.
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn build_router(&self) -> Router {
        router(self.manager.clone())
    }

    /// Serve until SIGINT or SIGTERM.
    pub async fn start(self) -> Result<()> {
        let app = self.build_router();
        let addr: SocketAddr = format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind_address, e))?;

        if self.bind_address == "0.0.0.0" {
            tracing::warn!("API bound to all interfaces; anyone on the network can start downloads");
        }

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. Set \"port\" in the config file or pass --port.",
                    self.port
                )
            } else {
                anyhow::anyhow!("Failed to bind {}: {}", addr, e)
            }
        })?;

        tracing::info!("Download API listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Routes for `manager`, with request tracing.
pub fn router(manager: JobManager) -> Router {
    let state = Arc::new(AppState { manager });

    Router::new()
        .route("/health", get(health))
        .route("/api/downloads", get(list_downloads).post(create_download))
        .route("/api/downloads/completed", delete(clear_completed))
        .route("/api/downloads/:id", get(get_download))
        .route("/api/downloads/:id/cancel", post(cancel_download))
        .route("/api/downloads/:id/retry", post(retry_download))
        .route("/api/downloads/:id/events", get(download_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: VERSION.to_string(),
        jobs: state.manager.get_all_jobs().len(),
    })
}

async fn list_downloads(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.manager.get_all_jobs())
}

async fn create_download(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateDownloadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let Json(request) = body.map_err(|e| ApiError::invalid_request(&e.body_text(), None))?;
    if request.url.trim().is_empty() {
        return Err(ApiError::invalid_request("url must not be empty", Some("url")));
    }
    let job = state.manager.create_job(request.url.trim(), request.options)?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    state
        .manager
        .get_job(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Download job"))
}

async fn cancel_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    if state.manager.get_job(&id).is_none() {
        return Err(ApiError::not_found("Download job"));
    }
    Ok(Json(CancelResponse {
        cancelled: state.manager.cancel_job(&id),
    }))
}

async fn retry_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.manager.retry_job(&id)?))
}

async fn clear_completed(State(state): State<Arc<AppState>>) -> Json<ClearResponse> {
    Json(ClearResponse {
        removed: state.manager.clear_completed(),
    })
}

/// Current snapshot first, then every update. The stream ends after a
/// terminal status.
async fn download_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (tx, rx) = mpsc::unbounded_channel::<Job>();
    let (snapshot, subscription) = state
        .manager
        .subscribe_with_snapshot(&id, move |job| {
            let _ = tx.send(job.clone());
        })
        .ok_or_else(|| ApiError::not_found("Download job"))?;

    Ok(Sse::new(job_events(snapshot, rx, subscription))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive")))
}

fn job_events(
    snapshot: Job,
    rx: mpsc::UnboundedReceiver<Job>,
    subscription: Subscription,
) -> impl Stream<Item = Result<Event, Infallible>> + Send {
    stream::once(ready(snapshot))
        .chain(UnboundedReceiverStream::new(rx))
        .scan((false, subscription), |(done, _subscription), job| {
            if *done {
                return ready(None);
            }
            *done = job.status.is_terminal();
            ready(Some(Ok::<_, Infallible>(job_event(&job))))
        })
}

fn job_event(job: &Job) -> Event {
    let event = Event::default().event(job.status.as_str());
    match serde_json::to_string(job) {
        Ok(data) => event.data(data),
        Err(e) => {
            tracing::warn!(job = %job.id, "Failed to encode job update: {}", e);
            event.comment("encoding error")
        }
    }
}
