// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Normalized metadata produced by the resolvers.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source-agnostic description of one model version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceMetadata {
    pub model_id: u64,
    pub model_name: String,
    /// Source type label such as `LORA` or `Checkpoint`.
    #[serde(default)]
    pub model_type: Option<String>,
    pub version_id: u64,
    pub version_name: String,
    /// Unset means the user has to confirm it.
    #[serde(default)]
    pub base_model: Option<String>,
    /// Candidate files in source order; never empty.
    pub files: Vec<SourceFile>,
    #[serde(default)]
    pub images: Vec<PreviewImage>,
    #[serde(default)]
    pub trained_words: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SourceMetadata {
    /// The file the manager downloads: the one flagged primary, else the first.
    pub fn primary_file(&self) -> Option<&SourceFile> {
        self.files
            .iter()
            .find(|f| f.primary)
            .or_else(|| self.files.first())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub id: u64,
    pub name: String,
    /// Declared type (`Model`, `Pruned Model`, `VAE`, ...).
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub size_kb: Option<f64>,
    /// Lowercase hex SHA-256.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub mirrors: Vec<Mirror>,
    #[serde(default)]
    pub primary: bool,
}

impl SourceFile {
    /// The direct URL, else the first available mirror.
    pub fn resolved_url(&self) -> Option<&str> {
        self.download_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or_else(|| {
                self.mirrors
                    .iter()
                    .find(|m| m.available && !m.url.is_empty())
                    .map(|m| m.url.as_str())
            })
    }

    /// Declared size in bytes, 0 when unknown.
    pub fn expected_bytes(&self) -> u64 {
        match self.size_kb {
            Some(kb) if kb.is_finite() && kb > 0.0 => (kb * 1024.0) as u64,
            _ => 0,
        }
    }
}

/// Alternate location for a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    pub url: String,
    #[serde(default)]
    pub source: Option<String>,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreviewImage {
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub nsfw_level: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub meta: Option<GenerationMeta>,
}

/// Generation parameters attached to a preview image.
///
/// Known fields are typed; everything else lands in `extra` and is written
/// back out unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl GenerationMeta {
    /// Interpret an arbitrary JSON blob.
    ///
    /// Objects whose known keys have unexpected types are kept whole in
    /// `extra`. Non-objects and empty objects yield `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(map) = value else {
            return None;
        };
        if map.is_empty() {
            return None;
        }
        match serde_json::from_value(Value::Object(map.clone())) {
            Ok(meta) => Some(meta),
            Err(_) => Some(GenerationMeta {
                extra: map.into_iter().collect(),
                ..Default::default()
            }),
        }
    }
}
