// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Source resolvers.
//!
//! A resolver recognises URLs of one origin and turns them into a normalized
//! [`SourceMetadata`]. Resolvers only talk to the network: they never touch
//! the filesystem or job state.
//!
//! | Source | Recognised URLs | Token service |
//! |--------|-----------------|---------------|
//! | civarchive | `civarchive.com/models/{id}` | none |
//! | civitai | `civitai.com/models/{id}[/slug]` | `civitai` |
//! | huggingface | `huggingface.co/{owner}/{repo}[/(blob\|resolve)/{rev}/{path}]` | `huggingface` |

pub mod civarchive;
pub mod civitai;
pub mod classify;
pub mod huggingface;
pub mod metadata;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::download::fetch::Fetcher;

pub use civarchive::CivarchiveResolver;
pub use civitai::CivitaiResolver;
pub use huggingface::HuggingFaceResolver;
pub use metadata::{GenerationMeta, Mirror, PreviewImage, SourceFile, SourceMetadata};

/// The supported origins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Civarchive,
    Civitai,
    Huggingface,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Civarchive => "civarchive",
            SourceKind::Civitai => "civitai",
            SourceKind::Huggingface => "huggingface",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter for one origin.
#[async_trait]
pub trait SourceResolver: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Returns true if `url` points at this origin in a shape it can resolve.
    fn matches(&self, url: &str) -> bool;

    /// Token service consulted before requests to this origin, if any.
    fn token_service(&self) -> Option<&'static str> {
        None
    }

    /// Returns true if `host` belongs to this origin. Bearer tokens are only
    /// ever attached to owned hosts.
    fn owns_host(&self, host: &str) -> bool;

    /// Fetch and normalize metadata for `url`.
    async fn resolve(&self, url: &str, token: Option<&str>) -> anyhow::Result<SourceMetadata>;
}

/// The three built-in resolvers sharing one fetcher.
pub fn default_resolvers(fetcher: &Fetcher) -> Vec<Arc<dyn SourceResolver>> {
    vec![
        Arc::new(CivarchiveResolver::new(fetcher.clone())),
        Arc::new(CivitaiResolver::new(fetcher.clone())),
        Arc::new(HuggingFaceResolver::new(fetcher.clone())),
    ]
}

/// First resolver that recognises `url`.
pub fn detect<'a>(
    resolvers: &'a [Arc<dyn SourceResolver>],
    url: &str,
) -> Option<&'a Arc<dyn SourceResolver>> {
    resolvers.iter().find(|r| r.matches(url))
}

/// Parse `url` and return it with its lowercased host.
pub(crate) fn parse_http_url(url: &str) -> Option<(Url, String)> {
    let parsed = Url::parse(url.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some((parsed, host))
}

/// `Authorization: Bearer {token}` header value, or `None` for a token that
/// cannot be sent as a header.
pub fn bearer(token: &str) -> Option<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim())).ok()?;
    value.set_sensitive(true);
    Some(value)
}

/// Headers carrying `token` as a bearer credential, empty when absent.
pub(crate) fn auth_headers(token: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(value) = token.and_then(bearer) {
        headers.insert(AUTHORIZATION, value);
    }
    headers
}
