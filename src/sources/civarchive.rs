// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Civarchive resolver.
//!
//! Civarchive keeps copies of models that were removed from civitai. Its
//! model pages embed their data as JSON in a `__NEXT_DATA__` script tag:
//!
//! ```text
//! props.pageProps.model = {
//!   id, name, type, description, tags,
//!   versions: [{ id, name, baseModel, trainedWords, images,
//!                files: [{ id, name, type, sizeKB, sha256, downloadUrl,
//!                          mirrors: [{ url, source, deletedAt }] }] }]
//! }
//! ```
//!
//! The original civitai URL of an archived file is usually dead, so the
//! first available mirror is preferred over `downloadUrl`.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;

use super::classify;
use super::metadata::{GenerationMeta, Mirror, PreviewImage, SourceFile, SourceMetadata};
use super::{parse_http_url, SourceKind, SourceResolver};
use crate::download::fetch::Fetcher;

pub const DEFAULT_BASE_URL: &str = "https://civarchive.com";

const HOSTS: &[&str] = &["civarchive.com", "www.civarchive.com"];

static NEXT_DATA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<script[^>]*\bid="__NEXT_DATA__"[^>]*>(.*?)</script>"#)
        .expect("__NEXT_DATA__ regex is valid")
});

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageModel {
    id: u64,
    name: String,
    #[serde(rename = "type", default)]
    model_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
    /// Plain strings or `{ "name": ... }` objects.
    #[serde(default)]
    tags: Vec<Value>,
    #[serde(default, alias = "modelVersions")]
    versions: Vec<PageVersion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageVersion {
    id: u64,
    name: String,
    #[serde(default)]
    base_model: Option<String>,
    #[serde(default)]
    trained_words: Vec<String>,
    #[serde(default)]
    files: Vec<PageFile>,
    #[serde(default)]
    images: Vec<PageImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageFile {
    id: u64,
    name: String,
    #[serde(rename = "type", default)]
    file_type: Option<String>,
    #[serde(rename = "sizeKB", default)]
    size_kb: Option<f64>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    hashes: HashMap<String, String>,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    mirrors: Vec<PageMirror>,
    #[serde(default)]
    primary: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageMirror {
    url: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    available: Option<bool>,
    #[serde(default)]
    deleted_at: Option<String>,
}

impl PageMirror {
    fn into_mirror(self) -> Mirror {
        let available = self.available.unwrap_or(self.deleted_at.is_none());
        Mirror {
            url: self.url,
            source: self.source,
            available,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageImage {
    #[serde(default)]
    id: Option<u64>,
    url: String,
    #[serde(default)]
    nsfw_level: Option<u32>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    meta: Option<Value>,
}

/// Model id and optional version id from a civarchive model URL.
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

/// Extract and parse the `__NEXT_DATA__` JSON of a page.
pub fn extract_next_data(html: &str) -> Result<Value> {
    let captures = NEXT_DATA
        .captures(html)
        .context("Civarchive page has no embedded model data")?;
    let raw = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
    serde_json::from_str(raw.trim()).context("Civarchive page data is not valid JSON")
}

/// Normalize the model embedded in a civarchive page.
pub fn parse_page(html: &str, requested_version: Option<u64>) -> Result<SourceMetadata> {
    let mut data = extract_next_data(html)?;
    let model_value = data
        .pointer_mut("/props/pageProps/model")
        .map(Value::take)
        .filter(|v| v.is_object())
        .context("Civarchive page data has no model")?;
    let model: PageModel =
        serde_json::from_value(model_value).context("Unrecognized civarchive model data")?;

    let PageModel {
        id: model_id,
        name: model_name,
        model_type,
        description,
        tags,
        mut versions,
    } = model;

    let index = match requested_version {
        Some(vid) => versions
            .iter()
            .position(|v| v.id == vid)
            .ok_or_else(|| anyhow!("Civarchive model {} has no version {}", model_id, vid))?,
        None if versions.is_empty() => bail!("Civarchive model {} has no versions", model_id),
        None => 0,
    };
    let version = versions.swap_remove(index);
    if version.files.is_empty() {
        bail!("Civarchive version {} has no files", version.id);
    }

    let tags: Vec<String> = tags
        .into_iter()
        .filter_map(|t| match t {
            Value::String(s) => Some(s),
            Value::Object(mut o) => match o.remove("name") {
                Some(Value::String(s)) => Some(s),
                _ => None,
            },
            _ => None,
        })
        .collect();

    let files: Vec<SourceFile> = version.files.into_iter().map(normalize_file).collect();
    let primary_name = files
        .iter()
        .find(|f| f.primary)
        .or_else(|| files.first())
        .map(|f| f.name.clone())
        .unwrap_or_default();

    let images = version
        .images
        .into_iter()
        .filter_map(|img| {
            Some(PreviewImage {
                id: img.id?,
                url: img.url,
                nsfw_level: img.nsfw_level,
                width: img.width,
                height: img.height,
                hash: img.hash,
                meta: img.meta.and_then(GenerationMeta::from_value),
            })
        })
        .collect();

    Ok(SourceMetadata {
        model_id,
        model_type: model_type
            .filter(|t| !t.trim().is_empty())
            .or_else(|| classify::classify_model_type(&primary_name, &tags)),
        model_name,
        version_id: version.id,
        version_name: version.name,
        base_model: version
            .base_model
            .filter(|b| !b.trim().is_empty())
            .or_else(|| classify::classify_base_model(&primary_name, &tags)),
        files,
        images,
        trained_words: version.trained_words,
        description,
        tags,
    })
}

fn normalize_file(f: PageFile) -> SourceFile {
    let mirrors: Vec<Mirror> = f.mirrors.into_iter().map(PageMirror::into_mirror).collect();
    let download_url = mirrors
        .iter()
        .find(|m| m.available && !m.url.is_empty())
        .map(|m| m.url.clone())
        .or(f.download_url);
    let sha256 = f
        .sha256
        .or_else(|| {
            f.hashes
                .into_iter()
                .find(|(algo, _)| algo.eq_ignore_ascii_case("sha256"))
                .map(|(_, hash)| hash)
        })
        .map(|h| h.to_ascii_lowercase());

    SourceFile {
        id: f.id,
        name: f.name,
        file_type: f.file_type,
        size_kb: f.size_kb,
        sha256,
        download_url,
        mirrors,
        primary: f.primary,
    }
}

/// Resolver for civarchive.com. Needs no token.
#[derive(Debug, Clone)]
pub struct CivarchiveResolver {
    fetcher: Fetcher,
    base_url: String,
}

impl CivarchiveResolver {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            fetcher,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Fetch pages from somewhere else (a proxy or a test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SourceResolver for CivarchiveResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Civarchive
    }

    fn matches(&self, url: &str) -> bool {
        parse_model_url(url).is_some()
    }

    fn owns_host(&self, host: &str) -> bool {
        HOSTS.contains(&host)
    }

    async fn resolve(&self, url: &str, _token: Option<&str>) -> Result<SourceMetadata> {
        let (model_id, version_id) =
            parse_model_url(url).with_context(|| format!("Not a civarchive model URL: {}", url))?;
        let mut page_url = format!("{}/models/{}", self.base_url, model_id);
        if let Some(vid) = version_id {
            page_url.push_str(&format!("?modelVersionId={}", vid));
        }
        tracing::debug!(model_id, version_id = ?version_id, "Fetching civarchive model page");

        let body = self
            .fetcher
            .fetch_to_buffer(&page_url, &HeaderMap::new())
            .await
            .map_err(|e| match e.status() {
                Some(404) => anyhow!("Civarchive model {} not found (HTTP 404)", model_id),
                _ => anyhow::Error::new(e),
            })?;
        parse_page(&String::from_utf8_lossy(&body), version_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(model: Value) -> String {
        format!(
            "<html><head></head><body><div id=\"__next\"></div>\
             <script id=\"__NEXT_DATA__\" type=\"application/json\">{}</script></body></html>",
            json!({"props": {"pageProps": {"model": model}}, "page": "/models/[id]"})
        )
    }

    fn model() -> Value {
        json!({
            "id": 123,
            "name": "Archived Style",
            "type": "LORA",
            "tags": ["style", {"name": "anime"}],
            "versions": [{
                "id": 456,
                "name": "v1",
                "baseModel": "Pony",
                "trainedWords": ["archstyle"],
                "files": [{
                    "id": 7,
                    "name": "archived_style.safetensors",
                    "type": "Model",
                    "sizeKB": 1.0,
                    "sha256": "ABC123",
                    "downloadUrl": "https://civitai.com/api/download/models/456",
                    "mirrors": [
                        {"url": "https://gone.example/a", "source": "tensorart", "deletedAt": "2024-05-01T00:00:00Z"},
                        {"url": "https://huggingface.co/u/r/resolve/main/a.safetensors", "source": "huggingface", "deletedAt": null}
                    ]
                }],
                "images": [{"id": 31, "url": "https://img.example/31.png", "meta": {"prompt": "p"}}]
            }]
        })
    }

    #[test]
    fn test_parse_model_url() {
        assert_eq!(parse_model_url("https://civarchive.com/models/123"), Some((123, None)));
        assert_eq!(
            parse_model_url("https://civarchive.com/models/123?modelVersionId=456"),
            Some((123, Some(456)))
        );
        assert_eq!(parse_model_url("https://civarchive.com/users/123"), None);
        assert_eq!(parse_model_url("https://civitai.com/models/123"), None);
    }

    #[test]
    fn test_parse_page_prefers_available_mirror() {
        let meta = parse_page(&page(model()), None).unwrap();
        assert_eq!(meta.model_id, 123);
        assert_eq!(meta.version_id, 456);
        assert_eq!(meta.base_model.as_deref(), Some("Pony"));
        assert_eq!(meta.tags, vec!["style", "anime"]);

        let file = meta.primary_file().unwrap();
        assert_eq!(file.mirrors.len(), 2);
        assert!(!file.mirrors[0].available);
        assert!(file.mirrors[1].available);
        assert_eq!(
            file.resolved_url(),
            Some("https://huggingface.co/u/r/resolve/main/a.safetensors")
        );
        assert_eq!(file.sha256.as_deref(), Some("abc123"));
        assert_eq!(meta.images[0].meta.as_ref().unwrap().prompt.as_deref(), Some("p"));
    }

    #[test]
    fn test_parse_page_falls_back_to_direct_url() {
        let mut m = model();
        m["versions"][0]["files"][0]["mirrors"] = json!([]);
        let meta = parse_page(&page(m), None).unwrap();
        assert_eq!(
            meta.primary_file().unwrap().resolved_url(),
            Some("https://civitai.com/api/download/models/456")
        );
    }

    #[test]
    fn test_parse_page_errors() {
        assert!(parse_page("<html>nothing here</html>", None)
            .unwrap_err()
            .to_string()
            .contains("no embedded model data"));
        assert!(parse_page(&page(model()), Some(999))
            .unwrap_err()
            .to_string()
            .contains("no version 999"));
        assert!(parse_page(&page(Value::Null), None).is_err());
    }
}
