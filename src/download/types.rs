// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download job types.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sources::SourceKind;

/// Lifecycle state of a job.
///
/// ```text
/// pending -> downloading -> completed
/// pending/downloading -> failed | cancelled
/// failed/cancelled --retry--> pending
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns true for `completed`, `failed` and `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Returns true if an explicit retry may re-open the job.
    pub fn is_retryable(self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Downloading => "downloading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User overrides supplied when a job is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobOptions {
    /// Output directory; relative paths are placed under the models root.
    #[serde(default)]
    pub output_dir: Option<String>,
    /// Replaces the model type reported by the source.
    #[serde(default)]
    pub model_type: Option<String>,
    /// Replaces the base model reported by the source.
    #[serde(default)]
    pub base_model: Option<String>,
}

/// A progress snapshot.
///
/// `percent` is always derived from `downloaded` and `total`; the only way to
/// build a value is through [`Progress::new`] or [`Progress::measure`], and
/// deserialization recomputes it as well.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", from = "ProgressRecord")]
pub struct Progress {
    downloaded: u64,
    total: u64,
    speed: u64,
    percent: f64,
    eta: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressRecord {
    #[serde(default)]
    downloaded: u64,
    #[serde(default)]
    total: u64,
    #[serde(default)]
    speed: u64,
    #[serde(default)]
    eta: u64,
}

impl From<ProgressRecord> for Progress {
    fn from(r: ProgressRecord) -> Self {
        Progress::new(r.downloaded, r.total, r.speed, r.eta)
    }
}

impl Progress {
    /// Build a snapshot; `total == 0` means the size is unknown.
    pub fn new(downloaded: u64, total: u64, speed: u64, eta: u64) -> Self {
        let percent = if total > 0 {
            downloaded as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        Self {
            downloaded,
            total,
            speed,
            percent,
            eta,
        }
    }

    /// Snapshot for a transfer that has moved `transferred` bytes in this
    /// session (out of `downloaded` on disk) over `elapsed`.
    pub fn measure(downloaded: u64, total: u64, transferred: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 {
            (transferred as f64 / secs) as u64
        } else {
            0
        };
        let eta = if speed > 0 && total > 0 {
            total.saturating_sub(downloaded) / speed
        } else {
            0
        };
        Self::new(downloaded, total, speed, eta)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Bytes per second averaged over the current transfer.
    pub fn speed(&self) -> u64 {
        self.speed
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    /// Estimated seconds remaining.
    pub fn eta(&self) -> u64 {
        self.eta
    }
}

/// A single requested download and its persisted lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    /// The page or repository URL the user submitted.
    pub url: String,
    pub source: SourceKind,
    #[serde(default)]
    pub options: CreateJobOptions,

    #[serde(default)]
    pub model_id: Option<u64>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub version_id: Option<u64>,
    #[serde(default)]
    pub version_name: Option<String>,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub base_model: Option<String>,

    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    /// The URL that serves the bytes, distinct from `url`.
    #[serde(default)]
    pub download_url: Option<String>,
    /// SHA-256 declared by the source, checked after the transfer.
    #[serde(default)]
    pub expected_sha256: Option<String>,

    #[serde(default)]
    pub progress: Progress,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a `pending` job that has not been resolved yet.
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        source: SourceKind,
        options: CreateJobOptions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            url: url.into(),
            source,
            options,
            model_id: None,
            model_name: None,
            version_id: None,
            version_name: None,
            model_type: None,
            base_model: None,
            output_dir: None,
            file_name: None,
            file_path: None,
            download_url: None,
            expected_sha256: None,
            progress: Progress::default(),
            status: JobStatus::Pending,
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// True when a retry can skip metadata resolution.
    pub fn has_resolved_download(&self) -> bool {
        self.download_url.is_some() && self.file_path.is_some() && self.model_id.is_some()
    }
}
