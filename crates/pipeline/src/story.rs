//! Story executor: text → (voice ∥ images) → per-scene video → merge/mix → upload.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use clipforge_generation::{AspectRatio, GenerationOutput, QueuedJob, StoryRequest};

use crate::failure::JobFailure;
use crate::provider::{
    ImageGenerator, ImageRequest, MediaComposer, ObjectStorage, ProviderError, SpeechSynthesizer,
    StoryPrompt, StoryScript, TextGenerator, VideoGenerator, content_hash, non_blank, non_empty,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoryConfig {
    /// Length of one generated scene clip.
    pub clip_seconds: f64,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self { clip_seconds: 5.0 }
    }
}

/// Providers consumed by the story flow.
#[derive(Clone)]
pub struct StoryProviders {
    pub text: Arc<dyn TextGenerator>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub image: Arc<dyn ImageGenerator>,
    pub video: Arc<dyn VideoGenerator>,
    pub composer: Arc<dyn MediaComposer>,
    pub storage: Arc<dyn ObjectStorage>,
}

struct Narration {
    audio: Vec<u8>,
    url: String,
}

#[derive(Clone)]
pub struct StoryExecutor {
    providers: StoryProviders,
    config: StoryConfig,
}

impl core::fmt::Debug for StoryExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoryExecutor")
            .field("config", &self.config)
            .finish()
    }
}

impl StoryExecutor {
    pub fn new(providers: StoryProviders, config: StoryConfig) -> Self {
        Self { providers, config }
    }

    /// Drive one story job to an uploaded video.
    ///
    /// Validation and the idempotency check happen in the dispatcher; persisting the
    /// result is the completion handler's job.
    #[instrument(skip_all, fields(job_id = %job.job_id, scenes = request.num_of_scenes))]
    pub async fn run(
        &self,
        job: &QueuedJob,
        request: &StoryRequest,
    ) -> Result<GenerationOutput, JobFailure> {
        let script = self.generate_script(request).await?;
        debug!(title = %script.title, "story script generated");

        // Voice-over and images are provider-independent; either failing aborts.
        let (narration, images) = tokio::try_join!(
            self.narrate(job, request, &script),
            self.scene_images(request, &script),
        )?;

        let clips = self
            .scene_clips(&images, &script.scenes, request.aspect_ratio)
            .await?;

        let merged = non_empty(self.providers.composer.concat(&clips).await?, "merged video")?;
        let video = match &narration {
            Some(narration) => {
                debug!(narration = %narration.url, "mixing narration");
                non_empty(
                    self.providers
                        .composer
                        .mix_audio(merged, &narration.audio)
                        .await?,
                    "mixed video",
                )?
            }
            None => merged,
        };

        let hash = content_hash(&video);
        let url = non_blank(
            self.providers
                .storage
                .upload(video, &format!("stories/{}", job.user_id), &hash, "video/mp4")
                .await?,
            "story upload url",
        )?;

        info!(result_url = %url, clips = clips.len(), "story generated");

        let mut output = GenerationOutput::new(url)
            .with_title(script.title)
            .with_duration(clips.len() as f64 * self.config.clip_seconds);
        if let Some(first) = images.into_iter().next() {
            output = output.with_thumbnail(first);
        }
        Ok(output)
    }

    async fn generate_script(&self, request: &StoryRequest) -> Result<StoryScript, ProviderError> {
        let prompt = StoryPrompt {
            prompt: request.prompt.clone(),
            num_of_scenes: request.num_of_scenes,
            style: request.style.clone(),
            language: request.voice_over.as_ref().map(|v| v.language.clone()),
        };
        let mut script = self.providers.text.generate_script(&prompt).await?;

        if script.scenes.len() != usize::from(request.num_of_scenes) {
            return Err(ProviderError::InvalidResult(format!(
                "expected {} scenes, got {}",
                request.num_of_scenes,
                script.scenes.len()
            )));
        }
        if script.scenes.iter().any(|s| s.trim().is_empty()) {
            return Err(ProviderError::InvalidResult("blank scene description".to_string()));
        }
        if script.title.trim().is_empty() {
            script.title = request.prompt.chars().take(60).collect();
        }
        Ok(script)
    }

    async fn narrate(
        &self,
        job: &QueuedJob,
        request: &StoryRequest,
        script: &StoryScript,
    ) -> Result<Option<Narration>, ProviderError> {
        let Some(voice) = &request.voice_over else {
            return Ok(None);
        };

        let voice_id = match voice.voice_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                self.providers
                    .speech
                    .resolve_voice(voice.gender.as_deref(), &voice.language)
                    .await?
            }
        };

        let audio = non_empty(
            self.providers
                .speech
                .synthesize(&script.voice_narrative, &voice_id)
                .await?,
            "narration audio",
        )?;

        let hash = content_hash(&audio);
        let url = non_blank(
            self.providers
                .storage
                .upload(
                    audio.clone(),
                    &format!("narrations/{}", job.user_id),
                    &hash,
                    "audio/mpeg",
                )
                .await?,
            "narration upload url",
        )?;

        Ok(Some(Narration { audio, url }))
    }

    async fn scene_images(
        &self,
        request: &StoryRequest,
        script: &StoryScript,
    ) -> Result<Vec<String>, ProviderError> {
        let images = self
            .providers
            .image
            .generate_scenes(&ImageRequest {
                scenes: script.scenes.clone(),
                narrative: script.image_narrative.clone(),
                style: request.style.clone(),
                aspect_ratio: request.aspect_ratio,
            })
            .await?;

        if images.len() != script.scenes.len() {
            return Err(ProviderError::InvalidResult(format!(
                "expected {} scene images, got {}",
                script.scenes.len(),
                images.len()
            )));
        }
        images
            .into_iter()
            .map(|url| non_blank(url, "scene image"))
            .collect()
    }

    /// Parallel batch first; scenes that failed in the batch are retried one at a
    /// time. Clips that succeeded in the batch are reused.
    async fn scene_clips(
        &self,
        images: &[String],
        scenes: &[String],
        aspect_ratio: AspectRatio,
    ) -> Result<Vec<String>, ProviderError> {
        let video = &self.providers.video;
        let batch = join_all(
            images
                .iter()
                .zip(scenes)
                .enumerate()
                .map(|(i, (image, scene))| video.generate_clip(i, image, scene, aspect_ratio)),
        )
        .await;

        let mut clips: Vec<Option<String>> = Vec::with_capacity(batch.len());
        let mut failed = Vec::new();
        for (i, result) in batch.into_iter().enumerate() {
            match result.and_then(|url| non_blank(url, "scene clip")) {
                Ok(url) => clips.push(Some(url)),
                Err(e) => {
                    debug!(scene = i, error = %e, "scene clip failed in batch");
                    failed.push(i);
                    clips.push(None);
                }
            }
        }

        if !failed.is_empty() {
            warn!(
                failed = failed.len(),
                total = clips.len(),
                "parallel clip batch failed; retrying failed scenes sequentially"
            );
            for i in failed {
                let url = video
                    .generate_clip(i, &images[i], &scenes[i], aspect_ratio)
                    .await
                    .and_then(|url| non_blank(url, "scene clip"))?;
                clips[i] = Some(url);
            }
        }

        clips
            .into_iter()
            .enumerate()
            .map(|(i, clip)| clip.ok_or_else(|| ProviderError::Empty(format!("scene {i} clip"))))
            .collect()
    }
}
