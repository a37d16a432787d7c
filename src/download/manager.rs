// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download job manager.
//!
//! Owns every [`Job`], runs each one as its own tokio task and funnels all
//! mutations through one update path that persists the whole store and then
//! notifies the job's listeners.
//!
//! Lock order is always `jobs` then `active`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use indexmap::IndexMap;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::broadcast::{dispatch, Broadcaster, Listener, Subscription};
use super::fetch::{FetchError, FetchOutcome, Fetcher};
use super::layout;
use super::sidecar::{self, ModelDict, MODEL_DICT_FILE};
use super::state::JobStore;
use super::types::{CreateJobOptions, Job, JobStatus, Progress};
use crate::config::Config;
use crate::locks::{read, write};
use crate::sources::{self, SourceKind, SourceMetadata, SourceResolver};
use crate::tokens::TokenStore;
use crate::utils::{generate_id, mask_sensitive, sha256_file};

/// Errors returned synchronously by manager operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// No resolver recognises the URL; no job was created.
    UnsupportedSource(String),
    NotFound(String),
    /// Retry requested for a job that is active or not failed/cancelled.
    NotRetryable { id: String, status: JobStatus },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::UnsupportedSource(url) => write!(f, "Unsupported download URL: {}", url),
            JobError::NotFound(id) => write!(f, "Download job not found: {}", id),
            JobError::NotRetryable { id, status } => {
                write!(f, "Download job {} cannot be retried while {}", id, status)
            }
        }
    }
}

impl std::error::Error for JobError {}

/// Manager settings not covered by the fetcher.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Root of the model library.
    pub models_dir: PathBuf,
    /// Jobs transferring at once; at least 1.
    pub max_concurrent_downloads: usize,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            models_dir: config.models_dir.clone(),
            max_concurrent_downloads: config.max_concurrent_downloads,
        }
    }
}

/// In-memory state of a running job.
struct ActiveJob {
    cancel: CancellationToken,
    listeners: Broadcaster,
}

impl ActiveJob {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            listeners: Broadcaster::new(),
        }
    }
}

struct Inner {
    settings: ManagerSettings,
    store: JobStore,
    fetcher: Fetcher,
    resolvers: Vec<Arc<dyn SourceResolver>>,
    tokens: Arc<dyn TokenStore>,
    /// Every known job in creation order.
    jobs: RwLock<IndexMap<String, Job>>,
    active: RwLock<HashMap<String, ActiveJob>>,
    permits: Arc<Semaphore>,
}

/// Handle to the download manager. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

/// Fields filled in by a metadata resolution.
struct Placement {
    model_id: u64,
    model_name: String,
    version_id: u64,
    version_name: String,
    model_type: Option<String>,
    base_model: Option<String>,
    output_dir: PathBuf,
    file_name: String,
    file_path: PathBuf,
    download_url: String,
    expected_sha256: Option<String>,
    expected_bytes: u64,
}

impl JobManager {
    /// Build a manager and load the persisted jobs.
    ///
    /// Jobs that were running when the process stopped come back `failed`.
    pub fn new(
        settings: ManagerSettings,
        store: JobStore,
        fetcher: Fetcher,
        resolvers: Vec<Arc<dyn SourceResolver>>,
        tokens: Arc<dyn TokenStore>,
    ) -> Self {
        let jobs: IndexMap<String, Job> = store
            .load()
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();
        tracing::info!(jobs = jobs.len(), store = %store.path().display(), "Download manager ready");

        let permits = Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1)));
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                fetcher,
                resolvers,
                tokens,
                jobs: RwLock::new(jobs),
                active: RwLock::new(HashMap::new()),
                permits,
            }),
        }
    }

    /// Build a manager with the built-in resolvers from configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let fetcher = Fetcher::new(&config.fetch_settings())?;
        let resolvers = sources::default_resolvers(&fetcher);
        Ok(Self::new(
            ManagerSettings::from_config(config),
            JobStore::new(config.job_store_path()),
            fetcher,
            resolvers,
            config.token_store(),
        ))
    }

    /// Create a job for `url` and start it in the background.
    ///
    /// Returns the new `pending` job right away. Must be called from within a
    /// tokio runtime.
    pub fn create_job(&self, url: &str, options: CreateJobOptions) -> Result<Job, JobError> {
        let url = url.trim();
        let resolver = sources::detect(&self.inner.resolvers, url)
            .ok_or_else(|| JobError::UnsupportedSource(url.to_string()))?;

        let job = Job::new(generate_id(), url, resolver.kind(), options);
        let cancel = CancellationToken::new();
        {
            let mut jobs = write(&self.inner.jobs);
            jobs.insert(job.id.clone(), job.clone());
            write(&self.inner.active).insert(job.id.clone(), ActiveJob::new(cancel.clone()));
            self.inner.store.persist(jobs.values());
        }

        tracing::info!(job_id = %job.id, source = %job.source, url = %job.url, "Download job created");
        self.spawn(job.id.clone(), cancel);
        Ok(job)
    }

    /// Signal cancellation of a running job. Returns false if the job is not
    /// active, including jobs that already finished.
    pub fn cancel_job(&self, id: &str) -> bool {
        match read(&self.inner.active).get(id) {
            Some(active) => {
                active.cancel.cancel();
                tracing::info!(job_id = %id, "Download job cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Re-open a `failed` or `cancelled` job and run it again on the
    /// previously resolved placement.
    pub fn retry_job(&self, id: &str) -> Result<Job, JobError> {
        let cancel = CancellationToken::new();
        let job = {
            let mut jobs = write(&self.inner.jobs);
            let job = jobs
                .get_mut(id)
                .ok_or_else(|| JobError::NotFound(id.to_string()))?;
            let mut active = write(&self.inner.active);
            if active.contains_key(id) || !job.status.is_retryable() {
                return Err(JobError::NotRetryable {
                    id: id.to_string(),
                    status: job.status,
                });
            }

            let partial = job
                .file_path
                .as_deref()
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .unwrap_or(0);

            job.status = JobStatus::Pending;
            job.error = None;
            job.retry_count += 1;
            job.completed_at = None;
            job.updated_at = Utc::now();
            job.progress = Progress::new(partial, job.progress.total(), 0, 0);

            active.insert(id.to_string(), ActiveJob::new(cancel.clone()));
            drop(active);

            let snapshot = job.clone();
            self.inner.store.persist(jobs.values());
            snapshot
        };

        tracing::info!(job_id = %id, retry = job.retry_count, "Download job retried");
        self.spawn(job.id.clone(), cancel);
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        read(&self.inner.jobs).get(id).cloned()
    }

    /// All jobs, newest first.
    pub fn get_all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = read(&self.inner.jobs).values().rev().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn is_active(&self, id: &str) -> bool {
        read(&self.inner.active).contains_key(id)
    }

    /// Listen to every update of a running job.
    ///
    /// Subscribing to a job that is not running returns an inert
    /// subscription.
    pub fn subscribe<F>(&self, id: &str, callback: F) -> Subscription
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.subscribe_with_snapshot(id, callback)
            .map(|(_, subscription)| subscription)
            .unwrap_or_else(Subscription::inert)
    }

    /// Like [`subscribe`](Self::subscribe), also returning the snapshot the
    /// subscription starts from. `None` if the job does not exist.
    ///
    /// Every update after the snapshot reaches `callback`.
    pub fn subscribe_with_snapshot<F>(&self, id: &str, callback: F) -> Option<(Job, Subscription)>
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        let jobs = read(&self.inner.jobs);
        let job = jobs.get(id)?.clone();
        let mut active = write(&self.inner.active);
        let Some(entry) = active.get_mut(id) else {
            return Some((job, Subscription::inert()));
        };
        let listener: Listener = Arc::new(callback);
        let listener_id = entry.listeners.add(listener);
        drop(active);
        drop(jobs);

        let inner = Arc::downgrade(&self.inner);
        let job_id = id.to_string();
        let subscription = Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                if let Some(entry) = write(&inner.active).get_mut(&job_id) {
                    entry.listeners.remove(listener_id);
                }
            }
        });
        Some((job, subscription))
    }

    /// Drop every finished job that is not running. Returns how many were
    /// removed.
    pub fn clear_completed(&self) -> usize {
        let mut jobs = write(&self.inner.jobs);
        let active = read(&self.inner.active);
        let before = jobs.len();
        jobs.retain(|id, job| !job.status.is_terminal() || active.contains_key(id));
        drop(active);

        let removed = before - jobs.len();
        if removed > 0 {
            self.inner.store.persist(jobs.values());
            tracing::info!(removed, "Cleared finished download jobs");
        }
        removed
    }

    fn spawn(&self, id: String, cancel: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_job(id, cancel).await;
        });
    }

    /// Wait for a slot, execute, and record exactly one terminal state.
    async fn run_job(self, id: String, cancel: CancellationToken) {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.inner.permits.clone().acquire_owned() => permit.ok(),
        };

        let result = match permit {
            Some(permit) => {
                let result = self.execute(&id, &cancel).await;
                drop(permit);
                result
            }
            None => Err(FetchError::Cancelled.into()),
        };

        match result {
            // A cancel that lands after the transfer still wins.
            _ if cancel.is_cancelled() => {
                if let Some(path) = self.get_job(&id).and_then(|j| j.file_path) {
                    remove_partial(&path).await;
                }
                tracing::info!(job_id = %id, "Download cancelled");
                self.finish(&id, JobStatus::Cancelled, None);
            }
            Ok(()) => {
                tracing::info!(job_id = %id, "Download completed");
                self.finish(&id, JobStatus::Completed, None);
            }
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(job_id = %id, error = %message, "Download failed");
                self.finish(&id, JobStatus::Failed, Some(message));
            }
        }
    }

    async fn execute(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let mut job = self
            .get_job(id)
            .ok_or_else(|| anyhow!("Download job {} no longer exists", id))?;
        let fast_path = job.has_resolved_download();
        let mut metadata: Option<SourceMetadata> = None;

        if !fast_path {
            let resolver = self.resolver_for(job.source)?;
            let meta = self.resolve_metadata(resolver.as_ref(), &job.url, cancel).await?;
            let placement = self.plan_placement(&job, &meta)?;
            tracing::info!(
                job_id = %id,
                model = %placement.model_name,
                version = %placement.version_name,
                path = %placement.file_path.display(),
                "Resolved download"
            );
            job = self.apply_placement(id, placement)?;
            metadata = Some(meta);
        } else {
            tracing::debug!(job_id = %id, "Reusing resolved download");
        }

        let file_path = job
            .file_path
            .clone()
            .context("Download job has no destination path")?;
        let meta_dir = layout::metadata_directory(&file_path, job.version_id.unwrap_or_default());
        tokio::fs::create_dir_all(&meta_dir)
            .await
            .with_context(|| format!("Failed to create directory: {:?}", meta_dir))?;

        let expected = job.progress.total();
        let existing = tokio::fs::metadata(&file_path).await.ok().map(|m| m.len());
        match existing {
            Some(size) if expected > 0 && size >= expected => {
                tracing::info!(job_id = %id, size, "File already present; skipping transfer");
                self.update_job(id, |j| j.progress = Progress::new(size, size, 0, 0));
            }
            _ => {
                self.update_job(id, |j| j.status = JobStatus::Downloading);
                let download_url = job
                    .download_url
                    .clone()
                    .context("Download job has no download URL")?;

                let outcome = match self.transfer(id, &download_url, &file_path, cancel).await {
                    Err(FetchError::Status { status: status @ (404 | 410), .. })
                        if fast_path && !cancel.is_cancelled() =>
                    {
                        tracing::warn!(job_id = %id, status, "Stored download URL is gone; re-resolving");
                        let resolver = self.resolver_for(job.source)?;
                        let meta = self
                            .resolve_metadata(resolver.as_ref(), &job.url, cancel)
                            .await
                            .context("Failed to refresh download URL")?;
                        let refreshed = meta
                            .primary_file()
                            .and_then(|f| f.resolved_url())
                            .map(str::to_string)
                            .context("Source no longer lists an available download")?;
                        job = self
                            .update_job(id, |j| j.download_url = Some(refreshed.clone()))
                            .ok_or_else(|| anyhow!("Download job {} no longer exists", id))?;
                        metadata = Some(meta);
                        self.transfer(id, &refreshed, &file_path, cancel).await
                    }
                    other => other,
                }?;
                tracing::debug!(job_id = %id, bytes = outcome.bytes, total = outcome.total, "Transfer finished");
            }
        }

        if let Some(expected) = job.expected_sha256.as_deref() {
            verify_sha256(&file_path, expected).await?;
        }

        self.write_sidecars(&job, metadata, &file_path, &meta_dir, cancel)
            .await;
        Ok(())
    }

    fn resolver_for(&self, kind: SourceKind) -> Result<Arc<dyn SourceResolver>> {
        self.inner
            .resolvers
            .iter()
            .find(|r| r.kind() == kind)
            .cloned()
            .ok_or_else(|| anyhow!("No resolver available for {}", kind))
    }

    async fn resolve_metadata(
        &self,
        resolver: &dyn SourceResolver,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<SourceMetadata> {
        let token = resolver
            .token_service()
            .and_then(|service| self.inner.tokens.get_token(service));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled.into()),
            meta = resolver.resolve(url, token.as_deref()) => {
                meta.with_context(|| format!("Failed to resolve {} metadata", resolver.kind()))
            }
        }
    }

    fn plan_placement(&self, job: &Job, meta: &SourceMetadata) -> Result<Placement> {
        let file = meta
            .primary_file()
            .context("Source did not list any downloadable files")?;
        let download_url = file
            .resolved_url()
            .with_context(|| format!("No available download location for {}", file.name))?
            .to_string();

        let model_type = job.options.model_type.clone().or_else(|| meta.model_type.clone());
        let base_model = job.options.base_model.clone().or_else(|| meta.base_model.clone());
        let output_dir = layout::output_directory(
            &self.inner.settings.models_dir,
            model_type.as_deref(),
            base_model.as_deref(),
            &meta.model_name,
            job.options.output_dir.as_deref(),
        );
        let file_name = layout::destination_file_name(&file.name, meta.model_id, meta.version_id);

        Ok(Placement {
            model_id: meta.model_id,
            model_name: meta.model_name.clone(),
            version_id: meta.version_id,
            version_name: meta.version_name.clone(),
            model_type,
            base_model,
            file_path: output_dir.join(&file_name),
            output_dir,
            file_name,
            download_url,
            expected_sha256: file.sha256.as_ref().map(|h| h.to_ascii_lowercase()),
            expected_bytes: file.expected_bytes(),
        })
    }

    fn apply_placement(&self, id: &str, p: Placement) -> Result<Job> {
        self.update_job(id, move |job| {
            job.model_id = Some(p.model_id);
            job.model_name = Some(p.model_name);
            job.version_id = Some(p.version_id);
            job.version_name = Some(p.version_name);
            job.model_type = p.model_type;
            job.base_model = p.base_model;
            job.output_dir = Some(p.output_dir);
            job.file_name = Some(p.file_name);
            job.file_path = Some(p.file_path);
            job.download_url = Some(p.download_url);
            job.expected_sha256 = p.expected_sha256;
            job.progress = Progress::new(job.progress.downloaded(), p.expected_bytes, 0, 0);
        })
        .ok_or_else(|| anyhow!("Download job {} no longer exists", id))
    }

    /// Stream `url` to `dest`, resuming from whatever is already on disk.
    async fn transfer(
        &self,
        id: &str,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        let resume_from = tokio::fs::metadata(dest).await.map(|m| m.len()).unwrap_or(0);
        if resume_from > 0 {
            tracing::info!(job_id = %id, resume_from, "Resuming partial download");
        }
        let headers = self.auth_headers(url);
        let manager = self.clone();
        let job_id = id.to_string();
        self.inner
            .fetcher
            .fetch_to_file(
                url,
                dest,
                &headers,
                resume_from,
                move |progress| {
                    manager.update_job(&job_id, |j| j.progress = progress);
                },
                cancel,
            )
            .await
    }

    /// Bearer header for `url` when its host belongs to a token-gated source
    /// and a token is configured.
    fn auth_headers(&self, url: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let Some((_, host)) = sources::parse_http_url(url) else {
            return headers;
        };
        let owner = self
            .inner
            .resolvers
            .iter()
            .find(|r| r.token_service().is_some() && r.owns_host(&host));
        if let Some(resolver) = owner {
            let service = resolver.token_service().unwrap_or_default();
            if let Some(token) = self.inner.tokens.get_token(service) {
                if let Some(value) = sources::bearer(&token) {
                    tracing::debug!(service, token = %mask_sensitive(&token, 4), host = %host, "Attaching access token");
                    headers.insert(AUTHORIZATION, value);
                }
            }
        }
        headers
    }

    /// Model dictionary and previews. Never fails the job.
    async fn write_sidecars(
        &self,
        job: &Job,
        metadata: Option<SourceMetadata>,
        file_path: &Path,
        meta_dir: &Path,
        cancel: &CancellationToken,
    ) {
        let metadata = match metadata {
            Some(meta) => Some(meta),
            None if !meta_dir.join(MODEL_DICT_FILE).exists() => {
                match self.resolver_for(job.source) {
                    Ok(resolver) => match self.resolve_metadata(resolver.as_ref(), &job.url, cancel).await {
                        Ok(meta) => Some(meta),
                        Err(e) => {
                            tracing::warn!(job_id = %job.id, error = %format!("{:#}", e), "Could not fetch metadata for sidecars");
                            None
                        }
                    },
                    Err(_) => None,
                }
            }
            None => None,
        };
        let Some(meta) = metadata else {
            return;
        };

        let size = tokio::fs::metadata(file_path).await.map(|m| m.len()).unwrap_or(0);
        let dict = ModelDict::build(job, &meta, size);
        if let Err(e) = sidecar::write_model_dict(meta_dir, &dict).await {
            tracing::warn!(job_id = %job.id, error = %format!("{:#}", e), "Failed to write model dictionary");
        }

        let saved = sidecar::download_previews(&self.inner.fetcher, meta_dir, &meta.images, cancel).await;
        if !meta.images.is_empty() {
            tracing::debug!(job_id = %job.id, saved, total = meta.images.len(), "Preview images saved");
        }
    }

    /// Apply `mutate` to a non-terminal job, persist, then notify.
    ///
    /// Returns the new snapshot, or `None` if the job is gone or terminal.
    fn update_job<F>(&self, id: &str, mutate: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let (snapshot, listeners) = {
            let mut jobs = write(&self.inner.jobs);
            let job = jobs.get_mut(id)?;
            if job.status.is_terminal() {
                return None;
            }
            mutate(job);
            job.updated_at = Utc::now();
            let snapshot = job.clone();

            self.inner.store.persist(jobs.values());
            let listeners = read(&self.inner.active)
                .get(id)
                .map(|a| a.listeners.listeners())
                .unwrap_or_default();
            (snapshot, listeners)
        };
        dispatch(&listeners, &snapshot);
        Some(snapshot)
    }

    /// Record the terminal state and retire the active entry in one step, so
    /// a retry can never observe a terminal job that is still active.
    fn finish(&self, id: &str, status: JobStatus, error: Option<String>) {
        let (snapshot, listeners) = {
            let mut jobs = write(&self.inner.jobs);
            let mut active = write(&self.inner.active);
            let retired = active.remove(id);
            drop(active);

            let Some(job) = jobs.get_mut(id) else {
                return;
            };
            if job.status.is_terminal() {
                return;
            }
            let now = Utc::now();
            job.status = status;
            job.error = error;
            job.updated_at = now;
            job.completed_at = Some(now);
            let snapshot = job.clone();

            self.inner.store.persist(jobs.values());
            let listeners = retired.map(|a| a.listeners.listeners()).unwrap_or_default();
            (snapshot, listeners)
        };
        dispatch(&listeners, &snapshot);
    }
}

async fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let target = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || sha256_file(&target))
        .await
        .context("Hashing task failed")?
        .with_context(|| format!("Failed to hash {:?}", path))?;

    if !actual.eq_ignore_ascii_case(expected) {
        remove_partial(path).await;
        bail!(
            "SHA-256 mismatch for {}: expected {}, got {}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default(),
            expected,
            actual
        );
    }
    Ok(())
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}
