// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Access tokens for gated sources.
//!
//! The download manager never owns credentials. It asks a [`TokenStore`] for
//! the token of a service (`"civitai"`, `"huggingface"`) right before a request
//! to that service's host.

use std::collections::HashMap;
use std::sync::Arc;

/// Lookup of bearer tokens by service name.
pub trait TokenStore: Send + Sync {
    /// Token for `service`, or `None` when the user has not configured one.
    fn get_token(&self, service: &str) -> Option<String>;
}

/// Tokens held in memory, typically loaded from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenStore {
    tokens: HashMap<String, String>,
}

impl StaticTokenStore {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn with_token(mut self, service: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(service.into(), token.into());
        self
    }
}

impl TokenStore for StaticTokenStore {
    fn get_token(&self, service: &str) -> Option<String> {
        self.tokens
            .get(service)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// Tokens read from the process environment.
///
/// - `civitai`: `CIVITAI_API_TOKEN`
/// - `huggingface`: `HF_TOKEN`, then `HUGGING_FACE_HUB_TOKEN`
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvTokenStore;

impl EnvTokenStore {
    fn variables(service: &str) -> &'static [&'static str] {
        match service {
            "civitai" => &["CIVITAI_API_TOKEN"],
            "huggingface" => &["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"],
            _ => &[],
        }
    }
}

impl TokenStore for EnvTokenStore {
    fn get_token(&self, service: &str) -> Option<String> {
        Self::variables(service)
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|t| t.trim().to_string())
            .find(|t| !t.is_empty())
    }
}

/// First store that has a token wins.
#[derive(Clone, Default)]
pub struct ChainedTokenStore {
    stores: Vec<Arc<dyn TokenStore>>,
}

impl ChainedTokenStore {
    pub fn new(stores: Vec<Arc<dyn TokenStore>>) -> Self {
        Self { stores }
    }
}

impl TokenStore for ChainedTokenStore {
    fn get_token(&self, service: &str) -> Option<String> {
        self.stores.iter().find_map(|s| s.get_token(service))
    }
}
