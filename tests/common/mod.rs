// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures: a local origin server and a resolver that points at it.

#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use modelvault::download::{FetchSettings, Fetcher, Job, JobManager, JobStore, ManagerSettings};
use modelvault::sources::{PreviewImage, SourceFile, SourceKind, SourceMetadata, SourceResolver};
use modelvault::tokens::StaticTokenStore;

pub const FILE_SIZE: usize = 1000;
pub const SLOW_SENT: usize = 500;

/// Deterministic payload served at `/files/model.bin`.
pub fn payload() -> Vec<u8> {
    (0..FILE_SIZE).map(|i| (i % 251) as u8).collect()
}

pub fn payload_sha256() -> String {
    hex::encode(Sha256::digest(payload()))
}

#[derive(Clone)]
struct OriginState {
    port: u16,
    model_hits: Arc<AtomicUsize>,
}

/// A running origin on 127.0.0.1.
pub struct Origin {
    pub addr: SocketAddr,
    model_hits: Arc<AtomicUsize>,
}

impl Origin {
    pub async fn start() -> Origin {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let model_hits = Arc::new(AtomicUsize::new(0));
        let state = OriginState {
            port: addr.port(),
            model_hits: model_hits.clone(),
        };

        let app = Router::new()
            .route("/files/model.bin", get(model_file))
            .route("/files/forbidden", get(forbidden))
            .route("/files/slow", get(slow_file))
            .route("/files/gone", get(gone))
            .route("/redirect/cross", get(redirect_cross))
            .route("/redirect/same", get(redirect_same))
            .route("/echo-auth", get(echo_auth))
            .route("/images/stall", get(stalled_image))
            .route("/images/:name", get(image))
            .with_state(state);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Origin { addr, model_hits }
    }

    /// URL on 127.0.0.1.
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), path)
    }

    pub fn model_hits(&self) -> usize {
        self.model_hits.load(Ordering::SeqCst)
    }
}

async fn model_file(State(state): State<OriginState>, headers: HeaderMap) -> Response {
    state.model_hits.fetch_add(1, Ordering::SeqCst);
    let data = payload();
    let start = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.strip_suffix('-'))
        .and_then(|v| v.parse::<usize>().ok());

    match start {
        Some(start) if start >= data.len() => {
            (StatusCode::RANGE_NOT_SATISFIABLE, "").into_response()
        }
        Some(start) => (
            StatusCode::PARTIAL_CONTENT,
            [(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, data.len() - 1, data.len()),
            )],
            data[start..].to_vec(),
        )
            .into_response(),
        None => data.into_response(),
    }
}

async fn forbidden() -> impl IntoResponse {
    (StatusCode::FORBIDDEN, "quota exceeded for this token")
}

async fn gone() -> impl IntoResponse {
    (StatusCode::GONE, "expired link")
}

/// Never answers.
async fn stalled_image() -> Response {
    std::future::pending().await
}

/// Declares the full length, sends half, then stalls.
async fn slow_file() -> Response {
    let first = stream::once(async { Ok::<_, Infallible>(Bytes::from(vec![7u8; SLOW_SENT])) });
    let body = Body::from_stream(first.chain(stream::pending()));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, FILE_SIZE.to_string())
        .body(body)
        .unwrap()
}

async fn redirect_cross(State(state): State<OriginState>) -> Response {
    redirect(&format!("http://localhost:{}/echo-auth", state.port))
}

async fn redirect_same() -> Response {
    redirect("/echo-auth")
}

fn redirect(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

async fn echo_auth(headers: HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none")
        .to_string()
}

async fn image() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "image/png")], vec![0x89, b'P', b'N', b'G'])
}

/// Resolver for `https://civarchive.com/models/...` pages whose files live on
/// the origin.
pub struct MockResolver {
    download_url: Mutex<String>,
    pub sha256: Option<String>,
    pub images: Vec<PreviewImage>,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl MockResolver {
    pub fn new(download_url: String) -> Self {
        Self {
            download_url: Mutex::new(download_url),
            sha256: None,
            images: Vec::new(),
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Point later resolutions at a different file.
    pub fn set_download_url(&self, url: String) {
        *self.download_url.lock().unwrap() = url;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceResolver for MockResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Civarchive
    }

    fn matches(&self, url: &str) -> bool {
        url.starts_with("https://civarchive.com/models/")
    }

    fn owns_host(&self, host: &str) -> bool {
        host == "civarchive.com"
    }

    async fn resolve(&self, _url: &str, _token: Option<&str>) -> Result<SourceMetadata> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            bail!("model page unavailable");
        }
        let download_url = self.download_url.lock().unwrap().clone();
        Ok(SourceMetadata {
            model_id: 42,
            model_name: "Detail Tweaker".into(),
            model_type: Some("LORA".into()),
            version_id: 7,
            version_name: "v1.0".into(),
            base_model: Some("SD 1.5".into()),
            files: vec![SourceFile {
                id: 1,
                name: "detail_tweaker.safetensors".into(),
                file_type: Some("Model".into()),
                size_kb: None,
                sha256: self.sha256.clone(),
                download_url: Some(download_url),
                mirrors: vec![],
                primary: true,
            }],
            images: self.images.clone(),
            trained_words: vec!["detailed".into()],
            description: Some("Adds detail".into()),
            tags: vec!["detail".into()],
        })
    }
}

pub fn fetcher() -> Fetcher {
    Fetcher::new(&FetchSettings {
        progress_interval: Duration::from_millis(20),
        ..FetchSettings::default()
    })
    .unwrap()
}

pub fn manager(dir: &TempDir, resolver: Arc<MockResolver>, max_concurrent: usize) -> JobManager {
    JobManager::new(
        ManagerSettings {
            models_dir: dir.path().join("models"),
            max_concurrent_downloads: max_concurrent,
        },
        JobStore::new(dir.path().join("jobs.json")),
        fetcher(),
        vec![resolver as Arc<dyn SourceResolver>],
        Arc::new(StaticTokenStore::default()),
    )
}

/// Poll until the job reaches a terminal status.
pub async fn wait_terminal(manager: &JobManager, id: &str) -> Job {
    wait_for(manager, id, |job| job.status.is_terminal()).await
}

pub async fn wait_for<F>(manager: &JobManager, id: &str, condition: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = manager.get_job(id).expect("job exists");
        if condition(&job) {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for job {}: {:?}", id, job.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
