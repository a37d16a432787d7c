// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! modelvault - local AI model library
//!
//! Resolves model pages on Civitai, CivArchive and Hugging Face, then
//! downloads the weights into an organized library with resumable,
//! cancellable background jobs that survive restarts.
//!
//! # Core Modules
//!
//! - [`download`] - Job manager, streaming fetcher, job store and progress broadcast
//! - [`sources`] - Per-site metadata resolvers
//! - [`server`] - HTTP API with server-sent progress events
//! - [`config`] - JSON configuration file and environment overrides
//! - [`tokens`] - Access tokens per service
//! - [`errors`] - API error responses with reference codes

pub mod config;
pub mod download;
pub mod errors;
pub mod locks;
pub mod server;
pub mod sources;
pub mod tokens;
pub mod utils;

pub use config::Config;
pub use download::{
    CreateJobOptions, FetchError, Fetcher, Job, JobError, JobManager, JobStatus, JobStore,
    Progress, Subscription,
};
pub use errors::{ApiError, ApiResult};
pub use server::Server;
pub use sources::{SourceKind, SourceMetadata, SourceResolver};
pub use tokens::TokenStore;
