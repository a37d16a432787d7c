// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Best-effort model type and base model classification.
//!
//! File names are checked first, then repository tags. When nothing matches
//! the result stays `None`; callers treat an unset base model as "needs user
//! confirmation", never as an error.

/// File-name fragments and the type they indicate, most specific first.
const TYPE_BY_FILE_NAME: &[(&str, &str)] = &[
    ("controlnet", "Controlnet"),
    ("control_", "Controlnet"),
    ("locon", "LoCon"),
    ("lora", "LORA"),
    ("hypernet", "Hypernetwork"),
    ("textual_inversion", "TextualInversion"),
    ("embedding", "TextualInversion"),
    ("esrgan", "Upscaler"),
    ("upscale", "Upscaler"),
    ("t5xxl", "TextEncoder"),
    ("umt5", "TextEncoder"),
    ("clip_l", "TextEncoder"),
    ("clip_g", "TextEncoder"),
    ("text_encoder", "TextEncoder"),
    ("vae", "VAE"),
];

/// Repository tags and the type they indicate.
const TYPE_BY_TAG: &[(&str, &str)] = &[
    ("lora", "LORA"),
    ("controlnet", "Controlnet"),
    ("textual_inversion", "TextualInversion"),
    ("vae", "VAE"),
    ("text-to-image", "Checkpoint"),
    ("image-to-image", "Checkpoint"),
    ("text-to-video", "Checkpoint"),
];

/// Text fragments and the base model they indicate, most specific first.
const BASE_BY_TEXT: &[(&str, &str)] = &[
    ("flux.1-schnell", "Flux.1 S"),
    ("flux1-schnell", "Flux.1 S"),
    ("flux", "Flux.1 D"),
    ("pony", "Pony"),
    ("illustrious", "Illustrious"),
    ("noobai", "NoobAI"),
    ("sdxl", "SDXL 1.0"),
    ("stable-diffusion-xl", "SDXL 1.0"),
    ("stable-diffusion-3.5", "SD 3.5"),
    ("sd3.5", "SD 3.5"),
    ("stable-diffusion-3", "SD 3"),
    ("sd3", "SD 3"),
    ("stable-diffusion-v1-5", "SD 1.5"),
    ("stable-diffusion-v1-4", "SD 1.4"),
    ("sd15", "SD 1.5"),
    ("sd1.5", "SD 1.5"),
    ("sd_1.5", "SD 1.5"),
    ("stable-diffusion-2-1", "SD 2.1"),
    ("hunyuanvideo", "Hunyuan Video"),
    ("wan2", "Wan Video"),
];

/// Type label from a file name, if any fragment matches.
pub fn model_type_from_file_name(file_name: &str) -> Option<&'static str> {
    let lower = file_name.to_lowercase();
    TYPE_BY_FILE_NAME
        .iter()
        .find(|(fragment, _)| lower.contains(fragment))
        .map(|(_, label)| *label)
}

/// Type label from repository tags, if any tag matches exactly.
pub fn model_type_from_tags(tags: &[String]) -> Option<&'static str> {
    TYPE_BY_TAG.iter().find_map(|(tag, label)| {
        tags.iter()
            .any(|t| t.eq_ignore_ascii_case(tag))
            .then_some(*label)
    })
}

/// File name first, then tags.
pub fn classify_model_type(file_name: &str, tags: &[String]) -> Option<String> {
    model_type_from_file_name(file_name)
        .or_else(|| model_type_from_tags(tags))
        .map(str::to_string)
}

/// Base model label mentioned in free text (a file name, repo id, card field).
pub fn base_model_from_text(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    BASE_BY_TEXT
        .iter()
        .find(|(fragment, _)| lower.contains(fragment))
        .map(|(_, label)| *label)
}

/// Base model from `base_model:{repo}` style tags, then plain tags.
pub fn base_model_from_tags(tags: &[String]) -> Option<&'static str> {
    tags.iter()
        .filter_map(|t| t.strip_prefix("base_model:"))
        .map(|t| t.rsplit(':').next().unwrap_or(t))
        .find_map(base_model_from_text)
        .or_else(|| tags.iter().find_map(|t| base_model_from_text(t)))
}

/// File name first, then tags.
pub fn classify_base_model(file_name: &str, tags: &[String]) -> Option<String> {
    base_model_from_text(file_name)
        .or_else(|| base_model_from_tags(tags))
        .map(str::to_string)
}
