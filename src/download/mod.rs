// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download job system for modelvault
//!
//! Accepts a model URL from a supported source, resolves it to a concrete
//! file, streams it into the model library and keeps the job state on disk
//! so that restarts, cancellation and retries behave predictably.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ JobManager      │────▶│ SourceResolver  │
//! │ (tokio tasks)   │     │ (per origin)    │
//! └──┬──────────┬───┘     └─────────────────┘
//!    │          │
//!    ▼          ▼
//! ┌────────┐ ┌─────────────────┐     ┌─────────────┐
//! │JobStore│ │ Fetcher         │     │ Broadcaster │
//! │ (JSON) │ │ (reqwest)       │     │ (listeners) │
//! └────────┘ └─────────────────┘     └─────────────┘
//! ```
//!
//! Every mutation is persisted before listeners see it.
//!
//! # Usage
//!
//! ```rust,no_run
//! use modelvault::config::Config;
//! use modelvault::download::{CreateJobOptions, JobManager};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = JobManager::from_config(&Config::load()?)?;
//!
//! let job = manager.create_job(
//!     "https://civitai.com/models/4201",
//!     CreateJobOptions::default(),
//! )?;
//!
//! let _subscription = manager.subscribe(&job.id, |job| {
//!     println!("{} {:.1}%", job.status, job.progress.percent());
//! });
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod fetch;
pub mod layout;
pub mod manager;
pub mod sidecar;
pub mod state;
pub mod types;

// Re-export commonly used items
pub use broadcast::{Broadcaster, Listener, Subscription};
pub use fetch::{FetchError, FetchOutcome, FetchSettings, Fetcher};
pub use manager::{JobError, JobManager, ManagerSettings};
pub use state::{JobStore, INTERRUPTED_MESSAGE};
pub use types::{CreateJobOptions, Job, JobStatus, Progress};
