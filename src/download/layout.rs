// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Where downloaded models land.
//!
//! ```text
//! {models_root}/{type_dir}/{base_model_dir}/{sanitized model name}/
//!     {stem}-mid{model_id}-vid{version_id}{.ext}
//!     meta_{version_id}/
//!         model_dict.json
//!         images/{image_id}.{ext}
//!         images/{image_id}.json
//! ```

use std::path::{Path, PathBuf};

/// Directory for a model type label. Unknown or missing types go to `other`.
pub fn type_directory(model_type: Option<&str>) -> &'static str {
    let normalized: String = model_type
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();

    match normalized.as_str() {
        "lora" | "locon" | "dora" | "lycoris" => "loras",
        "checkpoint" => "diffusion_models",
        "textualinversion" | "embedding" => "embeddings",
        "vae" => "vae",
        "controlnet" => "controlnet",
        "upscaler" => "upscale_models",
        "textencoder" => "text_encoders",
        "hypernetwork" => "hypernetworks",
        _ => "other",
    }
}

/// Known base models and their directory names.
const BASE_MODEL_ALIASES: &[(&str, &str)] = &[
    ("sd 1.4", "sd14"),
    ("sd 1.5", "sd15"),
    ("sd 1.5 lcm", "sd15"),
    ("sd 1.5 hyper", "sd15"),
    ("sd 2.0", "sd20"),
    ("sd 2.1", "sd21"),
    ("sdxl 1.0", "sdxl"),
    ("sdxl 0.9", "sdxl"),
    ("sdxl turbo", "sdxl"),
    ("sdxl lightning", "sdxl"),
    ("sdxl hyper", "sdxl"),
    ("pony", "pony"),
    ("illustrious", "illustrious"),
    ("noobai", "noobai"),
    ("sd 3", "sd3"),
    ("sd 3.5", "sd35"),
    ("sd 3.5 large", "sd35"),
    ("sd 3.5 medium", "sd35"),
    ("flux.1 d", "flux1"),
    ("flux.1 s", "flux1"),
    ("flux.1 dev", "flux1"),
    ("flux.1 schnell", "flux1"),
    ("hunyuan video", "hunyuan_video"),
    ("wan video", "wan"),
];

/// Directory for a base-model label: alias table, then slug, then `unknown`.
pub fn base_model_directory(base_model: Option<&str>) -> String {
    let Some(label) = base_model.map(str::trim).filter(|s| !s.is_empty()) else {
        return "unknown".to_string();
    };
    let lower = label.to_lowercase();

    if let Some((_, dir)) = BASE_MODEL_ALIASES.iter().find(|(alias, _)| *alias == lower) {
        return (*dir).to_string();
    }
    if lower.starts_with("flux.1") {
        return "flux1".to_string();
    }

    let slug = slugify(label);
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug
    }
}

/// Lowercase ASCII alphanumerics joined by single underscores.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_sep = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    slug
}

/// Strip characters that are illegal in path components on common
/// filesystems. Returns `unnamed` when nothing is left.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*'))
        .filter(|c| !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_end_matches('.').trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "unnamed".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Output directory for a model.
///
/// A user override wins; a relative override is placed under `models_root`.
pub fn output_directory(
    models_root: &Path,
    model_type: Option<&str>,
    base_model: Option<&str>,
    model_name: &str,
    override_dir: Option<&str>,
) -> PathBuf {
    if let Some(dir) = override_dir.map(str::trim).filter(|d| !d.is_empty()) {
        let dir = Path::new(dir);
        return if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            models_root.join(dir)
        };
    }

    models_root
        .join(type_directory(model_type))
        .join(base_model_directory(base_model))
        .join(sanitize_name(model_name))
}

/// File name embedding model and version ids so that identically named
/// files from different models never collide.
pub fn destination_file_name(original: &str, model_id: u64, version_id: u64) -> String {
    let original = sanitize_name(original);
    let path = Path::new(&original);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("model");
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-mid{}-vid{}.{}", stem, model_id, version_id, ext),
        None => format!("{}-mid{}-vid{}", stem, model_id, version_id),
    }
}

/// Sidecar directory next to the model file.
pub fn metadata_directory(file_path: &Path, version_id: u64) -> PathBuf {
    let parent = file_path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!("meta_{}", version_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_directory() {
        assert_eq!(type_directory(Some("LORA")), "loras");
        assert_eq!(type_directory(Some("LoCon")), "loras");
        assert_eq!(type_directory(Some("DoRA")), "loras");
        assert_eq!(type_directory(Some("Checkpoint")), "diffusion_models");
        assert_eq!(type_directory(Some("TextualInversion")), "embeddings");
        assert_eq!(type_directory(Some("VAE")), "vae");
        assert_eq!(type_directory(Some("Controlnet")), "controlnet");
        assert_eq!(type_directory(Some("Upscaler")), "upscale_models");
        assert_eq!(type_directory(Some("TextEncoder")), "text_encoders");
        assert_eq!(type_directory(Some("Hypernetwork")), "hypernetworks");
        assert_eq!(type_directory(Some("Poses")), "other");
        assert_eq!(type_directory(None), "other");
    }

    #[test]
    fn test_base_model_directory() {
        assert_eq!(base_model_directory(Some("SD 1.5")), "sd15");
        assert_eq!(base_model_directory(Some("SDXL 1.0")), "sdxl");
        assert_eq!(base_model_directory(Some("Pony")), "pony");
        assert_eq!(base_model_directory(Some("Flux.1 D")), "flux1");
        assert_eq!(base_model_directory(Some("Flux.1 Kontext")), "flux1");
        assert_eq!(base_model_directory(Some("Some New Model 2")), "some_new_model_2");
        assert_eq!(base_model_directory(Some("  ")), "unknown");
        assert_eq!(base_model_directory(Some("???")), "unknown");
        assert_eq!(base_model_directory(None), "unknown");
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("My: Model / v2?"), "My Model  v2");
        assert_eq!(sanitize_name("ok\u{0007}name"), "okname");
        assert_eq!(sanitize_name("***"), "unnamed");
        assert_eq!(sanitize_name(".."), "unnamed");
    }

    #[test]
    fn test_output_directory_layout() {
        let root = Path::new("/models");
        assert_eq!(
            output_directory(root, Some("LORA"), Some("SDXL 1.0"), "Detail Tweaker", None),
            PathBuf::from("/models/loras/sdxl/Detail Tweaker")
        );
        assert_eq!(
            output_directory(root, None, None, "x", None),
            PathBuf::from("/models/other/unknown/x")
        );
    }

    #[test]
    fn test_output_directory_override() {
        let root = Path::new("/models");
        assert_eq!(
            output_directory(root, Some("LORA"), None, "x", Some("custom/dir")),
            PathBuf::from("/models/custom/dir")
        );
        assert_eq!(
            output_directory(root, Some("LORA"), None, "x", Some("/srv/elsewhere")),
            PathBuf::from("/srv/elsewhere")
        );
    }

    #[test]
    fn test_destination_file_name() {
        assert_eq!(
            destination_file_name("detail.safetensors", 12, 34),
            "detail-mid12-vid34.safetensors"
        );
        assert_eq!(destination_file_name("README", 1, 2), "README-mid1-vid2");
        assert_eq!(
            destination_file_name("sub/dir/file.ckpt", 1, 2),
            "subdirfile-mid1-vid2.ckpt"
        );
    }

    #[test]
    fn test_metadata_directory() {
        assert_eq!(
            metadata_directory(Path::new("/models/loras/x/file.safetensors"), 34),
            PathBuf::from("/models/loras/x/meta_34")
        );
    }
}
