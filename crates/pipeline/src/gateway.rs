//! Story provider ports implemented over a generic [`ModelInvoker`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use clipforge_generation::AspectRatio;

use crate::client::ModelInvoker;
use crate::provider::{
    ImageGenerator, ImageRequest, MediaFetcher, ProviderError, SpeechSynthesizer, StoryPrompt,
    StoryScript, TextGenerator, VideoGenerator,
};

/// Provider endpoints used by the story flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryModels {
    pub text: String,
    pub image: String,
    pub video: String,
    pub speech: String,
}

impl Default for StoryModels {
    fn default() -> Self {
        Self {
            text: "openrouter/router".to_string(),
            image: "fal-ai/flux/dev".to_string(),
            video: "fal-ai/kling-video/v1.6/standard/image-to-video".to_string(),
            speech: "fal-ai/elevenlabs/tts".to_string(),
        }
    }
}

/// (language prefix, gender, voice id). First match wins; the last row is the fallback.
const VOICES: &[(&str, &str, &str)] = &[
    ("en", "female", "Rachel"),
    ("en", "male", "Adam"),
    ("es", "female", "Lucia"),
    ("es", "male", "Mateo"),
    ("fr", "female", "Chloe"),
    ("fr", "male", "Antoine"),
    ("de", "female", "Mila"),
    ("de", "male", "Lukas"),
    ("", "", "Rachel"),
];

fn pick_voice(gender: Option<&str>, language: &str) -> &'static str {
    let language = language.to_ascii_lowercase();
    let gender = gender.unwrap_or("female").to_ascii_lowercase();
    VOICES
        .iter()
        .find(|(lang, g, _)| {
            (lang.is_empty() || language.starts_with(lang)) && (g.is_empty() || *g == gender)
        })
        .map(|(_, _, voice)| *voice)
        .unwrap_or("Rachel")
}

/// Parse a text-model result into a [`StoryScript`].
///
/// Accepts the script inline or as a JSON string under `output`.
pub fn parse_script(data: &serde_json::Value) -> Result<StoryScript, ProviderError> {
    let doc = match data.get("output") {
        Some(serde_json::Value::String(raw)) => serde_json::from_str(raw)
            .map_err(|e| ProviderError::InvalidResult(format!("story script: {e}")))?,
        Some(inline) => inline.clone(),
        None => data.clone(),
    };
    serde_json::from_value(doc).map_err(|e| ProviderError::InvalidResult(format!("story script: {e}")))
}

/// Story providers backed by hosted models.
#[derive(Clone)]
pub struct ModelGateway {
    invoker: Arc<dyn ModelInvoker>,
    fetcher: Arc<dyn MediaFetcher>,
    models: StoryModels,
}

impl ModelGateway {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        fetcher: Arc<dyn MediaFetcher>,
        models: StoryModels,
    ) -> Self {
        Self {
            invoker,
            fetcher,
            models,
        }
    }
}

impl core::fmt::Debug for ModelGateway {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModelGateway")
            .field("models", &self.models)
            .finish()
    }
}

#[async_trait]
impl TextGenerator for ModelGateway {
    async fn generate_script(&self, prompt: &StoryPrompt) -> Result<StoryScript, ProviderError> {
        let input = serde_json::json!({
            "prompt": prompt.prompt,
            "numOfScenes": prompt.num_of_scenes,
            "style": prompt.style,
            "language": prompt.language,
            "responseFormat": "story_script",
        });
        let out = self.invoker.invoke(&self.models.text, input).await?;
        parse_script(&out.data)
    }
}

#[async_trait]
impl ImageGenerator for ModelGateway {
    async fn generate_scenes(&self, request: &ImageRequest) -> Result<Vec<String>, ProviderError> {
        let prompts: Vec<String> = request
            .scenes
            .iter()
            .enumerate()
            .map(|(i, scene)| match &request.style {
                Some(style) => format!("{}\nScene {}: {scene}\nStyle: {style}", request.narrative, i + 1),
                None => format!("{}\nScene {}: {scene}", request.narrative, i + 1),
            })
            .collect();

        let input = serde_json::json!({
            "prompts": prompts,
            "aspectRatio": request.aspect_ratio.as_str(),
            "consistentCharacters": true,
        });
        let out = self.invoker.invoke(&self.models.image, input).await?;
        if out.urls.len() != request.scenes.len() {
            return Err(ProviderError::InvalidResult(format!(
                "expected {} scene images, got {}",
                request.scenes.len(),
                out.urls.len()
            )));
        }
        Ok(out.urls)
    }
}

#[async_trait]
impl VideoGenerator for ModelGateway {
    async fn generate_clip(
        &self,
        scene_index: usize,
        image_url: &str,
        prompt: &str,
        aspect_ratio: AspectRatio,
    ) -> Result<String, ProviderError> {
        let input = serde_json::json!({
            "imageUrl": image_url,
            "prompt": prompt,
            "aspectRatio": aspect_ratio.as_str(),
        });
        let out = self.invoker.invoke(&self.models.video, input).await?;
        let url = out.first_url()?;
        debug!(scene_index, clip = %url, "scene clip generated");
        Ok(url)
    }
}

#[async_trait]
impl SpeechSynthesizer for ModelGateway {
    async fn resolve_voice(
        &self,
        gender: Option<&str>,
        language: &str,
    ) -> Result<String, ProviderError> {
        Ok(pick_voice(gender, language).to_string())
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        let input = serde_json::json!({ "text": text, "voice": voice_id });
        let out = self.invoker.invoke(&self.models.speech, input).await?;
        self.fetcher.fetch(&out.first_url()?).await
    }
}
