// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for modelvault.
//!
//! Stored as JSON at `~/.modelvault/config.json`. Every field is optional in
//! the file; missing fields take the defaults below. `MODELVAULT_MODELS_DIR`
//! and `MODELVAULT_DATA_DIR` override the two directories.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::fetch::FetchSettings;
use crate::tokens::{ChainedTokenStore, EnvTokenStore, StaticTokenStore, TokenStore};

/// Name of the per-user directory under `$HOME`.
const APP_DIR: &str = ".modelvault";

/// Default port for the HTTP API.
pub const DEFAULT_PORT: u16 = 8790;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root of the model library; job output directories live below it.
    pub models_dir: PathBuf,
    /// Application data; the job store is `{data_dir}/downloads/jobs.json`.
    pub data_dir: PathBuf,
    /// Access tokens keyed by service (`civitai`, `huggingface`).
    pub tokens: HashMap<String, String>,
    /// Jobs allowed to transfer at once; the rest wait as `pending`.
    pub max_concurrent_downloads: usize,
    /// Wall-clock interval between progress snapshots.
    pub progress_interval_ms: u64,
    pub connect_timeout_secs: u64,
    /// Idle timeout between reads of a response body.
    pub read_timeout_secs: u64,
    pub bind_address: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let base = app_dir();
        Self {
            models_dir: base.join("models"),
            data_dir: base,
            tokens: HashMap::new(),
            max_concurrent_downloads: 3,
            progress_interval_ms: 500,
            connect_timeout_secs: 30,
            read_timeout_secs: 120,
            bind_address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

fn app_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(APP_DIR))
}

/// Path of the default config file.
pub fn config_path() -> PathBuf {
    app_dir().join("config.json")
}

impl Config {
    /// Load the default config file, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load a config file, falling back to defaults when absent, then apply
    /// environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_path("MODELVAULT_MODELS_DIR") {
            self.models_dir = dir;
        }
        if let Some(dir) = env_path("MODELVAULT_DATA_DIR") {
            self.data_dir = dir;
        }
    }

    /// Location of the persisted job store.
    pub fn job_store_path(&self) -> PathBuf {
        self.data_dir.join("downloads").join("jobs.json")
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            read_timeout: Duration::from_secs(self.read_timeout_secs.max(1)),
            progress_interval: Duration::from_millis(self.progress_interval_ms.max(10)),
        }
    }

    /// Config-file tokens first, then the environment.
    pub fn token_store(&self) -> Arc<dyn TokenStore> {
        Arc::new(ChainedTokenStore::new(vec![
            Arc::new(StaticTokenStore::new(self.tokens.clone())),
            Arc::new(EnvTokenStore),
        ]))
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
