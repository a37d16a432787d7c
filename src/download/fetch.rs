// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transport for downloads and small payloads.
//!
//! Redirects are followed by hand so that caller headers can be dropped when
//! a hop leaves the original host. A bearer token meant for `civitai.com`
//! must never reach the CDN it redirects to.

use std::fmt;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode, Url};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::types::Progress;

/// Maximum redirect hops followed for one request.
pub const MAX_REDIRECTS: usize = 10;

/// Bytes of an error response body kept for diagnostics.
pub const MAX_ERROR_BODY: usize = 2000;

/// Timeouts and pacing for a [`Fetcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    /// Maximum idle time between two reads of a response.
    pub read_timeout: Duration,
    /// Wall-clock interval between progress callbacks.
    pub progress_interval: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Transport failure.
#[derive(Debug)]
pub enum FetchError {
    /// The server answered with a status >= 400.
    Status {
        status: u16,
        url: String,
        /// Up to [`MAX_ERROR_BODY`] bytes of the response body.
        body: String,
    },
    Network { url: String, message: String },
    Io(io::Error),
    TooManyRedirects { url: String },
    InvalidRedirect { url: String, location: String },
    Cancelled,
}

impl FetchError {
    /// HTTP status for [`FetchError::Status`].
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Status { status, url, body } => {
                write!(f, "HTTP {} from {}", status, url)?;
                let body = body.trim();
                if !body.is_empty() {
                    write!(f, ": {}", body)?;
                }
                Ok(())
            }
            FetchError::Network { url, message } => {
                write!(f, "Request to {} failed: {}", url, message)
            }
            FetchError::Io(e) => write!(f, "I/O error: {}", e),
            FetchError::TooManyRedirects { url } => {
                write!(f, "Too many redirects (more than {}) from {}", MAX_REDIRECTS, url)
            }
            FetchError::InvalidRedirect { url, location } => {
                write!(f, "Invalid redirect from {} to {:?}", url, location)
            }
            FetchError::Cancelled => write!(f, "Download cancelled"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(e: io::Error) -> Self {
        FetchError::Io(e)
    }
}

/// Result of a completed file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Size of the destination file.
    pub bytes: u64,
    /// Expected size, 0 when the server did not say.
    pub total: u64,
}

/// Shared HTTP client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: Client,
    progress_interval: Duration,
}

impl Fetcher {
    pub fn new(settings: &FetchSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.read_timeout)
            .user_agent(concat!("modelvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            progress_interval: settings.progress_interval,
        })
    }

    /// Send a GET and follow redirects.
    ///
    /// `headers` are sent to the first host and to every hop on that same
    /// host; they are cleared for good the first time a hop changes host or
    /// port. `range_from > 0` adds a `Range` header to every hop.
    pub async fn open(
        &self,
        url: &str,
        headers: &HeaderMap,
        range_from: u64,
    ) -> Result<Response, FetchError> {
        let mut current = Url::parse(url).map_err(|e| FetchError::Network {
            url: url.to_string(),
            message: format!("invalid URL: {}", e),
        })?;
        let mut headers = headers.clone();

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(current.clone()).headers(headers.clone());
            if range_from > 0 {
                request = request.header(RANGE, format!("bytes={}-", range_from));
            }

            let response = request.send().await.map_err(|e| network_error(&current, &e))?;
            let status = response.status();

            if is_followed_redirect(status) {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .unwrap_or_default();
                let next = current
                    .join(&location)
                    .ok()
                    .filter(|u| matches!(u.scheme(), "http" | "https"))
                    .ok_or_else(|| FetchError::InvalidRedirect {
                        url: current.to_string(),
                        location: location.clone(),
                    })?;

                if !same_host(&current, &next) && !headers.is_empty() {
                    tracing::debug!(
                        from = %current.host_str().unwrap_or_default(),
                        to = %next.host_str().unwrap_or_default(),
                        "Redirect leaves origin host; dropping request headers"
                    );
                    headers.clear();
                }
                current = next;
                continue;
            }

            if status.as_u16() >= 400 {
                return Err(status_error(response, &current).await);
            }
            return Ok(response);
        }

        Err(FetchError::TooManyRedirects {
            url: url.to_string(),
        })
    }

    /// Fetch a small payload into memory.
    pub async fn fetch_to_buffer(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> Result<Vec<u8>, FetchError> {
        let response = self.open(url, headers, 0).await?;
        let final_url = response.url().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| network_error(&final_url, &e))?;
        Ok(bytes.to_vec())
    }

    /// Stream `url` into `dest`.
    ///
    /// When `resume_from > 0` a range request is made; a `206` answer is
    /// appended to the existing file, anything else rewrites it from the
    /// start. The file is only opened after a successful status, so an HTTP
    /// error leaves nothing behind. `on_progress` runs every progress
    /// interval and once more at the end.
    ///
    /// On cancellation the destination file is deleted and
    /// [`FetchError::Cancelled`] is returned. Other failures after the
    /// transfer started keep the partial file for a later resume.
    pub async fn fetch_to_file<F>(
        &self,
        url: &str,
        dest: &Path,
        headers: &HeaderMap,
        resume_from: u64,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError>
    where
        F: FnMut(Progress),
    {
        if cancel.is_cancelled() {
            discard(dest).await;
            return Err(FetchError::Cancelled);
        }

        let mut resume_from = resume_from;
        let response = loop {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    discard(dest).await;
                    return Err(FetchError::Cancelled);
                }
                opened = self.open(url, headers, resume_from) => opened,
            };
            match opened {
                Err(FetchError::Status { status: 416, .. }) if resume_from > 0 => {
                    tracing::debug!(url, resume_from, "Range not satisfiable; restarting from zero");
                    resume_from = 0;
                }
                other => break other?,
            }
        };

        let appending = resume_from > 0 && response.status() == StatusCode::PARTIAL_CONTENT;
        let offset = if appending { resume_from } else { 0 };
        let total = response.content_length().map(|len| len + offset).unwrap_or(0);

        let mut file = if appending {
            OpenOptions::new().append(true).open(dest).await?
        } else {
            File::create(dest).await?
        };

        let final_url = response.url().clone();
        let mut stream = response.bytes_stream();
        let started = Instant::now();
        let mut downloaded = offset;
        let mut transferred = 0u64;

        let mut ticker = tokio::time::interval(self.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;

        let pumped: Result<(), FetchError> = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(FetchError::Cancelled),
                _ = ticker.tick() => {
                    on_progress(Progress::measure(downloaded, total, transferred, started.elapsed()));
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if let Err(e) = file.write_all(&bytes).await {
                            break Err(e.into());
                        }
                        downloaded += bytes.len() as u64;
                        transferred += bytes.len() as u64;
                    }
                    Some(Err(e)) => break Err(network_error(&final_url, &e)),
                    None => break Ok(()),
                },
            }
        };

        match pumped {
            Ok(()) => {
                file.flush().await?;
                file.sync_all().await?;
                drop(file);
                on_progress(Progress::measure(downloaded, total, transferred, started.elapsed()));
                Ok(FetchOutcome {
                    bytes: downloaded,
                    total,
                })
            }
            Err(e) => {
                drop(file);
                if e.is_cancelled() {
                    discard(dest).await;
                }
                Err(e)
            }
        }
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Host and effective port match.
fn same_host(a: &Url, b: &Url) -> bool {
    a.host_str().map(str::to_ascii_lowercase) == b.host_str().map(str::to_ascii_lowercase)
        && a.port_or_known_default() == b.port_or_known_default()
}

fn network_error(url: &Url, err: &reqwest::Error) -> FetchError {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    FetchError::Network {
        url: url.to_string(),
        message,
    }
}

async fn status_error(mut response: Response, url: &Url) -> FetchError {
    let status = response.status().as_u16();
    let mut body = Vec::new();
    while body.len() < MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            _ => break,
        }
    }
    body.truncate(MAX_ERROR_BODY);
    FetchError::Status {
        status,
        url: url.to_string(),
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial download"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}
