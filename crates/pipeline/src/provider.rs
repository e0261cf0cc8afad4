//! Ports to the external generation providers, media tooling and object storage.
//!
//! All calls are blocking-with-timeout from the executor's point of view.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use clipforge_generation::AspectRatio;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider job {request_id} failed: {message}")]
    Failed { request_id: String, message: String },

    #[error("provider returned an invalid result: {0}")]
    InvalidResult(String),

    #[error("provider returned an empty result: {0}")]
    Empty(String),

    #[error("provider did not finish within {0:?}")]
    Timeout(std::time::Duration),

    #[error("object storage error: {0}")]
    Storage(String),
}

/// Input to the text-generation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryPrompt {
    pub prompt: String,
    pub num_of_scenes: u8,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Text-generation output: title, one description per scene, and two narrative
/// variants (one tuned for image prompting, one for voice narration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryScript {
    pub title: String,
    pub scenes: Vec<String>,
    pub image_narrative: String,
    pub voice_narrative: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequest {
    pub scenes: Vec<String>,
    /// Shared narrative that keeps the scene images visually consistent.
    pub narrative: String,
    #[serde(default)]
    pub style: Option<String>,
    pub aspect_ratio: AspectRatio,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_script(&self, prompt: &StoryPrompt) -> Result<StoryScript, ProviderError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Pick a provider voice for the requested gender/language.
    async fn resolve_voice(
        &self,
        gender: Option<&str>,
        language: &str,
    ) -> Result<String, ProviderError>;

    /// Narration audio bytes.
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError>;
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    /// One image URL per scene, in scene order.
    async fn generate_scenes(&self, request: &ImageRequest) -> Result<Vec<String>, ProviderError>;
}

#[async_trait]
pub trait VideoGenerator: Send + Sync {
    /// Animate one scene image into a short clip; returns the clip URL.
    async fn generate_clip(
        &self,
        scene_index: usize,
        image_url: &str,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait MediaComposer: Send + Sync {
    /// Concatenate clips in the given order into one video buffer.
    async fn concat(&self, clip_urls: &[String]) -> Result<Vec<u8>, ProviderError>;

    /// Mix narration audio into a video buffer.
    async fn mix_audio(&self, video: Vec<u8>, audio: &[u8]) -> Result<Vec<u8>, ProviderError>;
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ProviderError>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `path`; `content_hash` names the object so identical uploads
    /// collide instead of duplicating. Returns the public URL.
    async fn upload(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_hash: &str,
        content_type: &str,
    ) -> Result<String, ProviderError>;
}

/// Hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Storage key for an upload: `<path>/<content_hash>.<ext>`.
pub fn object_key(path: &str, content_hash: &str, content_type: &str) -> String {
    let ext = match content_type {
        "video/mp4" => "mp4",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "audio/mpeg" => "mp3",
        "audio/wav" => "wav",
        _ => "bin",
    };
    let path = path.trim_matches('/');
    if path.is_empty() {
        format!("{content_hash}.{ext}")
    } else {
        format!("{path}/{content_hash}.{ext}")
    }
}

/// Reject an empty buffer from a media step.
pub(crate) fn non_empty(bytes: Vec<u8>, what: &str) -> Result<Vec<u8>, ProviderError> {
    if bytes.is_empty() {
        return Err(ProviderError::Empty(what.to_string()));
    }
    Ok(bytes)
}

/// Reject a blank URL from a provider.
pub(crate) fn non_blank(url: String, what: &str) -> Result<String, ProviderError> {
    if url.trim().is_empty() {
        return Err(ProviderError::Empty(what.to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_hex_sha256() {
        let h = content_hash(b"abc");
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(h, content_hash(b"abc"));
        assert_ne!(h, content_hash(b"abd"));
    }

    #[test]
    fn object_key_uses_content_hash_as_name() {
        assert_eq!(object_key("stories/u1/", "abc", "video/mp4"), "stories/u1/abc.mp4");
        assert_eq!(object_key("", "abc", "image/png"), "abc.png");
        assert_eq!(object_key("x", "abc", "application/zip"), "x/abc.bin");
    }

    #[test]
    fn empty_media_is_rejected() {
        assert!(matches!(
            non_empty(Vec::new(), "merged video"),
            Err(ProviderError::Empty(_))
        ));
        assert!(non_blank("  ".to_string(), "upload url").is_err());
        assert_eq!(non_empty(vec![1], "x").unwrap(), vec![1]);
    }
}
