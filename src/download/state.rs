// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent job store.
//!
//! The whole job collection is one JSON document, rewritten on every
//! mutation. Writes go to a temp file that is fsynced and renamed over the
//! store while an exclusive lock is held on a sibling `.lock` file, so a crash
//! never leaves a half-written store behind.
//!
//! Store failures are logged and swallowed: job tracking is best effort and
//! must never abort a running download.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::{Job, JobStatus};

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Current on-disk format version.
const STORE_VERSION: u32 = 1;

/// Error recorded on jobs that were running when the process stopped.
pub const INTERRUPTED_MESSAGE: &str = "Interrupted by application restart; retry to resume";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoreDocumentRef<'a> {
    version: u32,
    last_saved: DateTime<Utc>,
    jobs: Vec<&'a Job>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreDocument {
    #[serde(default)]
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    jobs: Vec<Job>,
}

/// Either the versioned document or a bare job array.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoreFile {
    Document(StoreDocument),
    Bare(Vec<Job>),
}

impl StoreFile {
    fn into_jobs(self) -> Vec<Job> {
        match self {
            StoreFile::Document(doc) => doc.jobs,
            StoreFile::Bare(jobs) => jobs,
        }
    }
}

/// JSON file holding every known job.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Load all jobs, failing any that were left `pending` or `downloading`.
    ///
    /// A missing, unreadable or corrupt store yields an empty list.
    pub fn load(&self) -> Vec<Job> {
        let mut jobs = match self.read_with_timeout(LOCK_TIMEOUT) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %format!("{:#}", e), "Failed to load job store");
                return Vec::new();
            }
        };

        let reconciled = reconcile_interrupted(&mut jobs);
        if reconciled > 0 {
            tracing::info!(count = reconciled, "Marked interrupted downloads as failed");
            self.persist(&jobs);
        }
        jobs
    }

    /// Replace the store with `jobs`.
    pub fn persist<'a, I>(&self, jobs: I)
    where
        I: IntoIterator<Item = &'a Job>,
    {
        let document = StoreDocumentRef {
            version: STORE_VERSION,
            last_saved: Utc::now(),
            jobs: jobs.into_iter().collect(),
        };
        if let Err(e) = self.write_with_timeout(&document, LOCK_TIMEOUT) {
            tracing::warn!(path = %self.path.display(), error = %format!("{:#}", e), "Failed to persist job store");
        }
    }

    fn read_with_timeout(&self, timeout: Duration) -> Result<Vec<Job>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let lock_file = open_lock_file(&self.lock_path())?;
        acquire_shared_lock_with_timeout(&lock_file, timeout)?;

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read job store: {:?}", self.path))?;
        let file: StoreFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse job store: {:?}", self.path))?;

        // Lock is released when lock_file is dropped
        Ok(file.into_jobs())
    }

    fn write_with_timeout(&self, document: &StoreDocumentRef<'_>, timeout: Duration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard = acquire_exclusive_lock_with_timeout(&self.lock_path(), timeout)?;

        let content = serde_json::to_string_pretty(document)
            .context("Failed to serialize job store to JSON")?;

        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .context("Failed to write to temp file")?;
            temp_file
                .sync_all()
                .context("Failed to sync temp file to disk")?;
        }

        // Atomic on POSIX; the lock is still held here
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!("Failed to rename temp file to job store: {:?} -> {:?}", temp_path, self.path)
        })?;
        Ok(())
    }
}

/// Fail every job that claims to be running. Returns how many changed.
fn reconcile_interrupted(jobs: &mut [Job]) -> usize {
    let now = Utc::now();
    let mut changed = 0;
    for job in jobs
        .iter_mut()
        .filter(|j| matches!(j.status, JobStatus::Pending | JobStatus::Downloading))
    {
        job.status = JobStatus::Failed;
        job.error = Some(INTERRUPTED_MESSAGE.to_string());
        job.updated_at = now;
        job.completed_at = Some(now);
        changed += 1;
    }
    changed
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {:?}", path))
}

/// Acquire an exclusive lock with timeout, returning the locked handle.
fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
    let lock_file = open_lock_file(path)?;
    let start = Instant::now();

    loop {
        match FileExt::try_lock_exclusive(&lock_file) {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for exclusive lock on {:?} after {:?}. \
                         Another instance may be writing to the job store.",
                        path,
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
            }
        }
    }
}

fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
    let start = Instant::now();

    loop {
        match FileExt::try_lock_shared(file) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if start.elapsed() >= timeout {
                    bail!(
                        "Timed out waiting for shared lock after {:?}. \
                         Another instance may be writing to the job store.",
                        timeout
                    );
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(e).context("Failed to acquire shared lock on job store");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceKind;
    use tempfile::TempDir;

    fn job(id: &str, status: JobStatus) -> Job {
        let mut job = Job::new(
            id,
            format!("https://civitai.com/models/{}", id),
            SourceKind::Civitai,
            Default::default(),
        );
        job.status = status;
        job
    }

    fn store(dir: &TempDir) -> JobStore {
        JobStore::new(dir.path().join("downloads").join("jobs.json"))
    }

    #[test]
    fn test_missing_store_loads_empty() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).load().is_empty());
    }

    #[test]
    fn test_persist_and_load_preserve_terminal_jobs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let jobs = vec![job("a", JobStatus::Completed), job("b", JobStatus::Cancelled)];
        store.persist(&jobs);

        let loaded = store.load();
        assert_eq!(loaded, jobs);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(raw["lastSaved"].is_string());
        assert_eq!(raw["jobs"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_load_reconciles_running_jobs_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.persist(&[
            job("a", JobStatus::Downloading),
            job("b", JobStatus::Pending),
            job("c", JobStatus::Completed),
        ]);

        let loaded = store.load();
        assert_eq!(loaded[0].status, JobStatus::Failed);
        assert_eq!(loaded[0].error.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert_eq!(loaded[1].status, JobStatus::Failed);
        assert_eq!(loaded[2].status, JobStatus::Completed);
        assert_eq!(loaded[2].error, None);

        // Reconciliation was written back
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("\"downloading\""));
        assert!(!raw.contains("\"pending\""));
    }

    #[test]
    fn test_bare_array_is_accepted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        let jobs = vec![job("a", JobStatus::Failed)];
        fs::write(store.path(), serde_json::to_string(&jobs).unwrap()).unwrap();

        assert_eq!(store.load(), jobs);
    }

    #[test]
    fn test_corrupt_store_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{\"jobs\": [").unwrap();

        assert!(store.load().is_empty());
    }

    #[test]
    fn test_persist_failure_is_swallowed() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        let store = JobStore::new(blocker.join("jobs.json"));

        // Parent is a file; must log and return
        store.persist(&[job("a", JobStatus::Completed)]);
        assert!(!store.path().exists());
    }

    #[test]
    fn test_lock_file_created_on_persist_and_temp_file_gone() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.persist(&[job("a", JobStatus::Completed)]);

        assert!(store.path().with_extension("lock").exists());
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("jobs.lock");

        let held = acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(1));
        assert!(held.is_ok());

        let start = Instant::now();
        let second = acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_millis(150));
        assert!(second.is_err());
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(second.unwrap_err().to_string().contains("Timed out"));

        drop(held);
        assert!(acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_shared_lock_waits_for_writer() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("jobs.lock");
        let writer = acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(1)).unwrap();

        let reader = open_lock_file(&lock_path).unwrap();
        let err = acquire_shared_lock_with_timeout(&reader, Duration::from_millis(100)).unwrap_err();
        assert!(err.to_string().contains("Timed out waiting for shared lock"));

        drop(writer);
        assert!(acquire_shared_lock_with_timeout(&reader, Duration::from_secs(1)).is_ok());
    }
}
