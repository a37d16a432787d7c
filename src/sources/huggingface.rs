// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Hugging Face resolver.
//!
//! Accepts repository URLs and file URLs:
//!
//! - `https://huggingface.co/{owner}/{repo}`
//! - `https://huggingface.co/{owner}/{repo}/tree/{rev}`
//! - `https://huggingface.co/{owner}/{repo}/(blob|resolve)/{rev}/{path}`
//!
//! Hugging Face has no numeric ids, so model, version and file ids are the
//! first six bytes of a SHA-256 over the repo id, `repo@rev` and
//! `repo@rev/path`. They are stable across runs and fit in a JSON number.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::classify;
use super::metadata::{SourceFile, SourceMetadata};
use super::{auth_headers, parse_http_url, SourceKind, SourceResolver};
use crate::download::fetch::{FetchError, Fetcher};

pub const DEFAULT_BASE_URL: &str = "https://huggingface.co";

const HOSTS: &[&str] = &["huggingface.co", "www.huggingface.co", "hf.co"];

/// Extensions treated as model weights.
pub const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "ckpt", "pt", "pth", "bin", "gguf", "sft"];

/// Path segments that cannot be a repository owner.
const RESERVED_OWNERS: &[&str] = &[
    "api", "datasets", "spaces", "docs", "blog", "models", "settings", "login", "join", "pricing",
];

/// A parsed Hugging Face model URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    /// `{owner}/{repo}`.
    pub repo_id: String,
    pub revision: Option<String>,
    /// File inside the repository, when the URL points at one.
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiModelInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(rename = "cardData", default)]
    card_data: Option<Value>,
    #[serde(default)]
    siblings: Vec<ApiSibling>,
}

#[derive(Debug, Deserialize)]
struct ApiSibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<ApiLfs>,
}

#[derive(Debug, Deserialize)]
struct ApiLfs {
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// Parse a repository or file URL.
pub fn parse_repo_url(url: &str) -> Option<RepoRef> {
    let (parsed, host) = parse_http_url(url)?;
    if !HOSTS.contains(&host.as_str()) {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 || RESERVED_OWNERS.contains(&segments[0]) {
        return None;
    }
    let repo_id = format!("{}/{}", segments[0], segments[1]);

    match segments.get(2).copied() {
        None => Some(RepoRef {
            repo_id,
            revision: None,
            path: None,
        }),
        Some("tree") => Some(RepoRef {
            repo_id,
            revision: segments.get(3).map(|s| s.to_string()),
            path: None,
        }),
        Some("blob") | Some("resolve") if segments.len() >= 5 => Some(RepoRef {
            repo_id,
            revision: Some(segments[3].to_string()),
            path: Some(segments[4..].join("/")),
        }),
        _ => None,
    }
}

/// Stable 48-bit id derived from `input`.
pub fn derived_id(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    digest[..6]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

fn is_weight_file(path: &str) -> bool {
    path.rsplit_once('.')
        .map(|(_, ext)| WEIGHT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// `base_model` from the model card, which may be a string or a list.
fn card_base_model(card: Option<&Value>) -> Option<String> {
    match card?.get("base_model")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
        _ => None,
    }
}

/// Normalize an `/api/models/{repo}?blobs=true` response.
pub fn parse_model_info(
    body: &[u8],
    repo: &RepoRef,
    base_url: &str,
) -> Result<SourceMetadata> {
    let info: ApiModelInfo =
        serde_json::from_slice(body).context("Unrecognized Hugging Face API response")?;
    let repo_id = info.id.clone().unwrap_or_else(|| repo.repo_id.clone());
    let revision = repo
        .revision
        .clone()
        .or_else(|| info.sha.clone())
        .unwrap_or_else(|| "main".to_string());

    let file_for = |path: &str, size: Option<u64>, sha256: Option<String>, primary: bool| SourceFile {
        id: derived_id(&format!("{}@{}/{}", repo_id, revision, path)),
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        file_type: Some("Model".to_string()),
        size_kb: size.map(|bytes| bytes as f64 / 1024.0),
        sha256: sha256.map(|h| h.to_ascii_lowercase()),
        download_url: Some(format!(
            "{}/{}/resolve/{}/{}",
            base_url.trim_end_matches('/'),
            repo_id,
            revision,
            path
        )),
        mirrors: Vec::new(),
        primary,
    };

    let files: Vec<SourceFile> = match repo.path.as_deref() {
        Some(path) => {
            let sibling = info.siblings.iter().find(|s| s.rfilename == path);
            let size = sibling.and_then(|s| s.lfs.as_ref().and_then(|l| l.size).or(s.size));
            let sha = sibling.and_then(|s| s.lfs.as_ref().and_then(|l| l.sha256.clone()));
            vec![file_for(path, size, sha, true)]
        }
        None => {
            let weights: Vec<&ApiSibling> = info
                .siblings
                .iter()
                .filter(|s| is_weight_file(&s.rfilename))
                .collect();
            let primary = weights
                .iter()
                .position(|s| s.rfilename.ends_with(".safetensors"))
                .unwrap_or(0);
            weights
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let lfs = s.lfs.as_ref();
                    file_for(
                        &s.rfilename,
                        lfs.and_then(|l| l.size).or(s.size),
                        lfs.and_then(|l| l.sha256.clone()),
                        i == primary,
                    )
                })
                .collect()
        }
    };
    if files.is_empty() {
        bail!("Hugging Face repository {} has no model weight files", repo_id);
    }

    let primary_name = files
        .iter()
        .find(|f| f.primary)
        .map(|f| f.name.clone())
        .unwrap_or_default();
    let model_type = classify::classify_model_type(&primary_name, &info.tags);
    let base_model = card_base_model(info.card_data.as_ref())
        .and_then(|b| classify::base_model_from_text(&b).map(str::to_string))
        .or_else(|| classify::classify_base_model(&primary_name, &info.tags));
    let model_name = repo_id.rsplit('/').next().unwrap_or(&repo_id).to_string();

    Ok(SourceMetadata {
        model_id: derived_id(&repo_id),
        model_name,
        model_type,
        version_id: derived_id(&format!("{}@{}", repo_id, revision)),
        version_name: revision,
        base_model,
        files,
        images: Vec::new(),
        trained_words: Vec::new(),
        description: None,
        tags: info.tags,
    })
}

/// Resolver for huggingface.co model repositories.
#[derive(Debug, Clone)]
pub struct HuggingFaceResolver {
    fetcher: Fetcher,
    base_url: String,
}

impl HuggingFaceResolver {
    pub fn new(fetcher: Fetcher) -> Self {
        Self {
            fetcher,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Use another hub endpoint (a mirror or a test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SourceResolver for HuggingFaceResolver {
    fn kind(&self) -> SourceKind {
        SourceKind::Huggingface
    }

    fn matches(&self, url: &str) -> bool {
        parse_repo_url(url).is_some()
    }

    fn token_service(&self) -> Option<&'static str> {
        Some("huggingface")
    }

    fn owns_host(&self, host: &str) -> bool {
        HOSTS.contains(&host)
    }

    async fn resolve(&self, url: &str, token: Option<&str>) -> Result<SourceMetadata> {
        let repo = parse_repo_url(url)
            .with_context(|| format!("Not a Hugging Face model URL: {}", url))?;
        let mut api_url = format!("{}/api/models/{}", self.base_url, repo.repo_id);
        if let Some(rev) = &repo.revision {
            api_url.push_str(&format!("/revision/{}", rev));
        }
        api_url.push_str("?blobs=true");
        tracing::debug!(repo = %repo.repo_id, revision = ?repo.revision, "Fetching Hugging Face model info");

        let body = self
            .fetcher
            .fetch_to_buffer(&api_url, &auth_headers(token))
            .await
            .map_err(|e| api_error(e, &repo.repo_id, token.is_some()))?;
        parse_model_info(&body, &repo, &self.base_url)
    }
}

fn api_error(err: FetchError, repo_id: &str, had_token: bool) -> anyhow::Error {
    match err.status() {
        Some(status @ (401 | 403)) if had_token => anyhow!(
            "Hugging Face rejected the configured access token for {} (HTTP {}); accept the model license or check the token",
            repo_id,
            status
        ),
        Some(status @ (401 | 403)) => anyhow!(
            "Hugging Face repository {} is gated (HTTP {}); configure a huggingface token",
            repo_id,
            status
        ),
        Some(404) => anyhow!("Hugging Face repository {} not found (HTTP 404)", repo_id),
        _ => anyhow::Error::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "acme/detail-lora",
            "sha": "0123abcd",
            "tags": ["lora", "base_model:adapter:stabilityai/stable-diffusion-xl-base-1.0"],
            "cardData": {"base_model": "stabilityai/stable-diffusion-xl-base-1.0"},
            "siblings": [
                {"rfilename": "README.md", "size": 100},
                {"rfilename": "detail.ckpt", "size": 2048},
                {"rfilename": "detail.safetensors", "size": 1024,
                 "lfs": {"sha256": "FFEE", "size": 1024}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_repo_url() {
        assert_eq!(
            parse_repo_url("https://huggingface.co/acme/detail-lora"),
            Some(RepoRef {
                repo_id: "acme/detail-lora".into(),
                revision: None,
                path: None
            })
        );
        assert_eq!(
            parse_repo_url("https://hf.co/acme/detail-lora/blob/v2/weights/detail.safetensors"),
            Some(RepoRef {
                repo_id: "acme/detail-lora".into(),
                revision: Some("v2".into()),
                path: Some("weights/detail.safetensors".into())
            })
        );
        assert_eq!(
            parse_repo_url("https://huggingface.co/acme/detail-lora/tree/dev").and_then(|r| r.revision),
            Some("dev".into())
        );
        assert_eq!(parse_repo_url("https://huggingface.co/datasets/acme/x"), None);
        assert_eq!(parse_repo_url("https://huggingface.co/acme"), None);
        assert_eq!(parse_repo_url("https://huggingface.co/acme/x/discussions/1"), None);
    }

    #[test]
    fn test_derived_ids_are_stable_and_bounded() {
        let a = derived_id("acme/detail-lora");
        assert_eq!(a, derived_id("acme/detail-lora"));
        assert_ne!(a, derived_id("acme/other"));
        assert!(a < (1u64 << 48));
    }

    #[test]
    fn test_parse_model_info_repo() {
        let repo = parse_repo_url("https://huggingface.co/acme/detail-lora").unwrap();
        let meta = parse_model_info(&info(), &repo, DEFAULT_BASE_URL).unwrap();

        assert_eq!(meta.model_name, "detail-lora");
        assert_eq!(meta.version_name, "0123abcd");
        assert_eq!(meta.model_type.as_deref(), Some("LORA"));
        assert_eq!(meta.base_model.as_deref(), Some("SDXL 1.0"));
        assert_eq!(meta.files.len(), 2);

        let primary = meta.primary_file().unwrap();
        assert_eq!(primary.name, "detail.safetensors");
        assert_eq!(primary.sha256.as_deref(), Some("ffee"));
        assert_eq!(primary.expected_bytes(), 1024);
        assert_eq!(
            primary.resolved_url(),
            Some("https://huggingface.co/acme/detail-lora/resolve/0123abcd/detail.safetensors")
        );
    }

    #[test]
    fn test_parse_model_info_single_file() {
        let repo = parse_repo_url("https://huggingface.co/acme/detail-lora/resolve/main/detail.ckpt")
            .unwrap();
        let meta = parse_model_info(&info(), &repo, "http://127.0.0.1:9000/").unwrap();
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.version_name, "main");
        assert_eq!(
            meta.files[0].resolved_url(),
            Some("http://127.0.0.1:9000/acme/detail-lora/resolve/main/detail.ckpt")
        );
    }

    #[test]
    fn test_parse_model_info_without_weights() {
        let repo = parse_repo_url("https://huggingface.co/acme/docs-only").unwrap();
        let body = serde_json::to_vec(&json!({"siblings": [{"rfilename": "README.md"}]})).unwrap();
        let err = parse_model_info(&body, &repo, DEFAULT_BASE_URL).unwrap_err();
        assert!(err.to_string().contains("no model weight files"));
    }
}
