//! Request payloads for the three generation kinds.
//!
//! The payload is a tagged union serialised as `{ "kind": ..., "payload": ... }`
//! so the dispatch boundary can match on it exhaustively.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use clipforge_core::DomainError;

use crate::job::JobKind;

/// Upper bound on scenes per story (keeps the per-job provider fan-out small).
pub const MAX_SCENES: u8 = 8;

/// Upper bound on prompt length, in characters.
pub const MAX_PROMPT_CHARS: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Missing(&'static str),

    #[error("prompt exceeds {max} characters")]
    PromptTooLong { max: usize },

    #[error("numOfScenes must be between 1 and {max} (got {got})")]
    SceneCount { max: u8, got: u8 },

    #[error("{0} must be an http(s) URL")]
    InvalidUrl(&'static str),
}

impl From<ValidationError> for DomainError {
    fn from(value: ValidationError) -> Self {
        DomainError::validation(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "9:16")]
    Portrait,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            AspectRatio::Portrait => "9:16",
            AspectRatio::Landscape => "16:9",
            AspectRatio::Square => "1:1",
        }
    }
}

/// Narration settings for a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceOverRequest {
    /// Explicit provider voice; resolved from `gender`/`language` when absent.
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    pub language: String,
}

/// Multi-scene story video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryRequest {
    pub prompt: String,
    pub num_of_scenes: u8,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub voice_over: Option<VoiceOverRequest>,
}

/// Single-model visual effect applied to one input image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectRequest {
    /// Provider endpoint of the effect model.
    pub effect_id: String,
    pub image_url: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// General media generation from the model library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationLibRequest {
    /// Provider endpoint of the library model.
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub media: MediaKind,
}

/// Tagged payload union across the three queue kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum JobPayload {
    Story(StoryRequest),
    Effect(EffectRequest),
    GenerationLib(GenerationLibRequest),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Story(_) => JobKind::Story,
            JobPayload::Effect(_) => JobKind::Effect,
            JobPayload::GenerationLib(_) => JobKind::GenerationLib,
        }
    }

    /// Check required fields and bounds.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            JobPayload::Story(story) => {
                validate_prompt(&story.prompt)?;
                if story.num_of_scenes == 0 || story.num_of_scenes > MAX_SCENES {
                    return Err(ValidationError::SceneCount {
                        max: MAX_SCENES,
                        got: story.num_of_scenes,
                    });
                }
                if let Some(voice) = &story.voice_over {
                    if voice.language.trim().is_empty() {
                        return Err(ValidationError::Missing("voiceOver.language"));
                    }
                }
                Ok(())
            }
            JobPayload::Effect(effect) => {
                if effect.effect_id.trim().is_empty() {
                    return Err(ValidationError::Missing("effectId"));
                }
                validate_url("imageUrl", &effect.image_url)
            }
            JobPayload::GenerationLib(lib) => {
                if lib.model.trim().is_empty() {
                    return Err(ValidationError::Missing("model"));
                }
                validate_prompt(&lib.prompt)?;
                match &lib.image_url {
                    Some(url) => validate_url("imageUrl", url),
                    None => Ok(()),
                }
            }
        }
    }
}

fn validate_prompt(prompt: &str) -> Result<(), ValidationError> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Missing("prompt"));
    }
    if trimmed.chars().count() > MAX_PROMPT_CHARS {
        return Err(ValidationError::PromptTooLong {
            max: MAX_PROMPT_CHARS,
        });
    }
    Ok(())
}

fn validate_url(field: &'static str, url: &str) -> Result<(), ValidationError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(ValidationError::Missing(field));
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ValidationError::InvalidUrl(field));
    }
    Ok(())
}
