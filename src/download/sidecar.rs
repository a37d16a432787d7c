// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sidecar files written next to a downloaded model.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use reqwest::header::HeaderMap;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::fetch::Fetcher;
use super::types::Job;
use crate::sources::{PreviewImage, SourceKind, SourceMetadata};

pub const MODEL_DICT_FILE: &str = "model_dict.json";
pub const IMAGES_DIR: &str = "images";

/// The downloaded file as recorded in the model dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DictFile {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    pub download_url: String,
}

/// Normalized description of a downloaded model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDict {
    pub source: SourceKind,
    pub source_url: String,
    pub model_id: u64,
    pub model_name: String,
    #[serde(default)]
    pub model_type: Option<String>,
    pub version_id: u64,
    pub version_name: String,
    #[serde(default)]
    pub base_model: Option<String>,
    pub file: DictFile,
    #[serde(default)]
    pub trained_words: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Ids of the preview images under `images/`.
    #[serde(default)]
    pub images: Vec<u64>,
    pub downloaded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl ModelDict {
    /// Assemble from the job (which carries user overrides) and the metadata.
    pub fn build(job: &Job, meta: &SourceMetadata, file_size: u64) -> Self {
        let file = meta.primary_file();
        Self {
            source: job.source,
            source_url: job.url.clone(),
            model_id: job.model_id.unwrap_or(meta.model_id),
            model_name: job.model_name.clone().unwrap_or_else(|| meta.model_name.clone()),
            model_type: job.model_type.clone().or_else(|| meta.model_type.clone()),
            version_id: job.version_id.unwrap_or(meta.version_id),
            version_name: job
                .version_name
                .clone()
                .unwrap_or_else(|| meta.version_name.clone()),
            base_model: job.base_model.clone().or_else(|| meta.base_model.clone()),
            file: DictFile {
                name: job
                    .file_name
                    .clone()
                    .or_else(|| file.map(|f| f.name.clone()))
                    .unwrap_or_default(),
                size: file_size,
                sha256: job
                    .expected_sha256
                    .clone()
                    .or_else(|| file.and_then(|f| f.sha256.clone())),
                download_url: job.download_url.clone().unwrap_or_default(),
            },
            trained_words: meta.trained_words.clone(),
            description: meta.description.clone(),
            tags: meta.tags.clone(),
            images: meta.images.iter().map(|i| i.id).collect(),
            downloaded_at: Utc::now(),
            extra: IndexMap::new(),
        }
    }
}

/// Write `model_dict.json` into `meta_dir`.
pub async fn write_model_dict(meta_dir: &Path, dict: &ModelDict) -> Result<PathBuf> {
    fs::create_dir_all(meta_dir)
        .await
        .with_context(|| format!("Failed to create metadata directory: {:?}", meta_dir))?;
    let path = meta_dir.join(MODEL_DICT_FILE);
    let content = serde_json::to_vec_pretty(dict).context("Failed to serialize model dictionary")?;
    fs::write(&path, content)
        .await
        .with_context(|| format!("Failed to write model dictionary: {:?}", path))?;
    Ok(path)
}

/// Download preview images one at a time into `meta_dir/images`.
///
/// Each image gets `{id}.{ext}` plus `{id}.json`. Failures are logged and
/// skipped. Returns how many images were saved.
pub async fn download_previews(
    fetcher: &Fetcher,
    meta_dir: &Path,
    images: &[PreviewImage],
    cancel: &CancellationToken,
) -> usize {
    if images.is_empty() {
        return 0;
    }
    let dir = meta_dir.join(IMAGES_DIR);
    if let Err(e) = fs::create_dir_all(&dir).await {
        tracing::warn!(path = %dir.display(), error = %e, "Failed to create preview directory");
        return 0;
    }

    let mut saved = 0;
    for image in images {
        if cancel.is_cancelled() {
            break;
        }
        match save_preview(fetcher, &dir, image, cancel).await {
            Ok(()) => saved += 1,
            Err(e) => tracing::warn!(
                image_id = image.id,
                url = %image.url,
                error = %format!("{:#}", e),
                "Failed to save preview image"
            ),
        }
    }
    saved
}

async fn save_preview(
    fetcher: &Fetcher,
    dir: &Path,
    image: &PreviewImage,
    cancel: &CancellationToken,
) -> Result<()> {
    let headers = HeaderMap::new();
    let bytes = tokio::select! {
        biased;
        _ = cancel.cancelled() => anyhow::bail!("cancelled"),
        bytes = fetcher.fetch_to_buffer(&image.url, &headers) => bytes?,
    };

    let ext = image_extension(&image.url);
    fs::write(dir.join(format!("{}.{}", image.id, ext)), &bytes)
        .await
        .context("Failed to write preview image")?;

    let sidecar = serde_json::to_vec_pretty(image).context("Failed to serialize image sidecar")?;
    fs::write(dir.join(format!("{}.json", image.id)), sidecar)
        .await
        .context("Failed to write image sidecar")?;
    Ok(())
}

/// Extension from the URL path when it is a known media type, else `jpeg`.
fn image_extension(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
        })
        .filter(|ext| matches!(ext.as_str(), "jpg" | "jpeg" | "png" | "webp" | "gif" | "mp4" | "webm"))
        .unwrap_or_else(|| "jpeg".to_string())
}
