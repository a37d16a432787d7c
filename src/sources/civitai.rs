// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Civitai resolver.
//!
//! `https://civitai.com/models/{id}[/slug][?modelVersionId=N]` is resolved
//! through the public `/api/v1/models/{id}` endpoint. Gated models need a
//! token from the `civitai` token service.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::classify;
use super::metadata::{GenerationMeta, PreviewImage, SourceFile, SourceMetadata};
use super::{auth_headers, parse_http_url, SourceKind, SourceResolver};
use crate::download::fetch::{FetchError, Fetcher};

pub const DEFAULT_API_BASE: &str = "https://civitai.com";

const HOSTS: &[&str] = &["civitai.com", "www.civitai.com"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiModel {
    id: u64,
    name: String,
    #[serde(rename = "type", default)]
    model_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    model_versions: Vec<ApiVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVersion {
    id: u64,
    name: String,
    #[serde(default)]
    base_model: Option<String>,
    #[serde(default)]
    trained_words: Vec<String>,
    #[serde(default)]
    files: Vec<ApiFile>,
    #[serde(default)]
    images: Vec<ApiImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiFile {
    id: u64,
    name: String,
    #[serde(rename = "type", default)]
    file_type: Option<String>,
    #[serde(rename = "sizeKB", default)]
    size_kb: Option<f64>,
    #[serde(default)]
    hashes: HashMap<String, String>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    primary: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiImage {
    #[serde(default)]
    id: Option<u64>,
    url: String,
    /// Numeric on current API versions, a string on older ones.
    #[serde(default)]
    nsfw_level: Option<Value>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    meta: Option<Value>,
}

/// Model id and optional version id from a civitai model page URL.
pub fn parse_model_url(url: &str) -> Option<(u64, Option<u64>)> {
    let (parsed, host) = parse_http_url(url)?;
    if !HOSTS.contains(&host.as_str()) {
        return None;
    }
    let mut segments = parsed.path_segments()?;
    if segments.next()? != "models" {
        return None;
    }
    let model_id = segments.next()?.parse().ok()?;
    let version_id = parsed
        .query_pairs()
        .find(|(key, _)| key == "modelVersionId")
        .and_then(|(_, value)| value.parse().ok());
    Some((model_id, version_id))
}

/// Normalize an `/api/v1/models/{id}` response.
pub fn parse_model_response(body: &[u8], requested_version: Option<u64>) -> Result<SourceMetadata> {
    let model: ApiModel =
        serde_json::from_slice(body).context("Unrecognized civitai API response")?;

    let version_index = match requested_version {
        Some(vid) => model
            .model_versions
            .iter()
            .position(|v| v.id == vid)
            .with_context(|| format!("Civitai model {} has no version {}", model.id, vid))?,
        None if model.model_versions.is_empty() => {
            bail!("Civitai model {} has no versions", model.id)
        }
        None => 0,
    };
    let ApiModel {
        id: model_id,
        name: model_name,
        model_type,
        description,
        tags,
        mut model_versions,
    } = model;
    let version = model_versions.swap_remove(version_index);

    if version.files.is_empty() {
        bail!("Civitai version {} has no files", version.id);
    }

    let files: Vec<SourceFile> = version
        .files
        .into_iter()
        .map(|f| SourceFile {
            sha256: f
                .hashes
                .iter()
                .find(|(algo, _)| algo.eq_ignore_ascii_case("sha256"))
                .map(|(_, hash)| hash.to_ascii_lowercase()),
            id: f.id,
            name: f.name,
            file_type: f.file_type,
            size_kb: f.size_kb,
            download_url: f.download_url,
            mirrors: Vec::new(),
            primary: f.primary,
        })
        .collect();

    let primary_name = files
        .iter()
        .find(|f| f.primary)
        .or_else(|| files.first())
        .map(|f| f.name.clone())
        .unwrap_or_default();

    let model_type = model_type
        .filter(|t| !t.trim().is_empty())
        .or_else(|| classify::classify_model_type(&primary_name, &tags));
    let base_model = version
        .base_model
        .filter(|b| !b.trim().is_empty())
        .or_else(|| classify::classify_base_model(&primary_name, &tags));

    let images = version
        .images
        .into_iter()
        .filter_map(|img| {
            Some(PreviewImage {
                id: img.id?,
                url: img.url,
                nsfw_level: img.nsfw_level.as_ref().and_then(Value::as_u64).map(|n| n as u32),
                width: img.width,
                height: img.height,
                hash: img.hash,
                meta: img.meta.and_then(GenerationMeta::from_value),
            })
        })
        .collect();

    Ok(SourceMetadata {
        model_id,
        model_name,
        model_type,
        version_id: version.id,
        version_name: version.name,
        base_model,
        files,
        images,
        trained_words: version.trained_words,
        description,
        tags,
    })
}

/// Resolver for civitai.com.
#[derive(Debug, Clone)]
pub struct CivitaiResolver {
    fetcher: Fetcher,
    api_base: String,
}

impl CivitaiResolver {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            fetcher,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    /// Point API calls somewhere else (a proxy or a test server).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SourceResolver for CivitaiResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Civitai
    }

    fn matches(&self, url: &str) -> bool {
        parse_model_url(url).is_some()
    }

    fn token_service(&self) -> Option<&'static str> {
        Some("civitai")
    }

    fn owns_host(&self, host: &str) -> bool {
        HOSTS.contains(&host)
    }

    async fn resolve(&self, url: &str, token: Option<&str>) -> Result<SourceMetadata> {
        let (model_id, version_id) =
            parse_model_url(url).with_context(|| format!("Not a civitai model URL: {}", url))?;
        let api_url = format!("{}/api/v1/models/{}", self.api_base, model_id);
        tracing::debug!(model_id, version_id = ?version_id, "Fetching civitai model metadata");

        let body = self
            .fetcher
            .fetch_to_buffer(&api_url, &auth_headers(token))
            .await
            .map_err(|e| api_error(e, model_id, token.is_some()))?;
        parse_model_response(&body, version_id)
    }
}

fn api_error(err: FetchError, model_id: u64, had_token: bool) -> anyhow::Error {
    match err.status() {
        Some(status @ (401 | 403)) if had_token => anyhow!(
            "Civitai rejected the configured access token for model {} (HTTP {})",
            model_id,
            status
        ),
        Some(status @ (401 | 403)) => anyhow!(
            "Civitai model {} requires authorization (HTTP {}); configure a civitai API token",
            model_id,
            status
        ),
        Some(404) => anyhow!("Civitai model {} not found (HTTP 404)", model_id),
        _ => anyhow::Error::new(err),
    }
}
