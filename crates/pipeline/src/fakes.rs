//! Scripted providers for tests/dev.
//!
//! One [`FakeProviders`] implements every provider port, records call counts per
//! operation and can be told to fail specific calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use clipforge_core::JobId;
use clipforge_generation::{AspectRatio, Job};

use crate::client::{ModelInvoker, ProviderOutput};
use crate::dispatcher::{JobLookup, LookupError};
use crate::provider::{
    ImageGenerator, ImageRequest, MediaComposer, MediaFetcher, ObjectStorage, ProviderError,
    SpeechSynthesizer, StoryPrompt, StoryScript, TextGenerator, VideoGenerator, object_key,
};
use crate::story::StoryProviders;

pub mod ops {
    pub const TEXT: &str = "text";
    pub const VOICE: &str = "voice";
    pub const SPEECH: &str = "speech";
    pub const IMAGE: &str = "image";
    pub const VIDEO: &str = "video";
    pub const CONCAT: &str = "concat";
    pub const MIX: &str = "mix";
    pub const UPLOAD: &str = "upload";
    pub const INVOKE: &str = "invoke";
    pub const FETCH: &str = "fetch";
}

#[derive(Debug, Default)]
struct FakeState {
    calls: BTreeMap<&'static str, usize>,
    video_attempts: Vec<usize>,
    video_failures: HashMap<usize, u32>,
    uploads: Vec<String>,
    fail_text: bool,
    fail_images: bool,
    fail_invoke: bool,
    empty_merge: bool,
    empty_fetch: bool,
}

#[derive(Debug, Default)]
pub struct FakeProviders {
    state: Mutex<FakeState>,
}

impl FakeProviders {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    fn record(&self, op: &'static str) {
        self.with_state(|s| *s.calls.entry(op).or_default() += 1);
    }

    /// Make the next `attempts` clip requests for `scene` fail.
    pub fn fail_video_attempts(&self, scene: usize, attempts: u32) {
        self.with_state(|s| {
            s.video_failures.insert(scene, attempts);
        });
    }

    pub fn fail_text(&self) {
        self.with_state(|s| s.fail_text = true);
    }

    pub fn fail_images(&self) {
        self.with_state(|s| s.fail_images = true);
    }

    pub fn fail_invoke(&self) {
        self.with_state(|s| s.fail_invoke = true);
    }

    pub fn empty_merge(&self) {
        self.with_state(|s| s.empty_merge = true);
    }

    pub fn empty_fetch(&self) {
        self.with_state(|s| s.empty_fetch = true);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.with_state(|s| s.calls.get(op).copied().unwrap_or(0))
    }

    pub fn total_calls(&self) -> usize {
        self.with_state(|s| s.calls.values().sum())
    }

    /// Scene indices in the order clip generation was requested.
    pub fn video_attempts(&self) -> Vec<usize> {
        self.with_state(|s| s.video_attempts.clone())
    }

    pub fn uploads(&self) -> Vec<String> {
        self.with_state(|s| s.uploads.clone())
    }

    pub fn story_providers(self: &Arc<Self>) -> StoryProviders {
        StoryProviders {
            text: self.clone(),
            speech: self.clone(),
            image: self.clone(),
            video: self.clone(),
            composer: self.clone(),
            storage: self.clone(),
        }
    }
}

#[async_trait]
impl TextGenerator for FakeProviders {
    async fn generate_script(&self, prompt: &StoryPrompt) -> Result<StoryScript, ProviderError> {
        self.record(ops::TEXT);
        if self.with_state(|s| s.fail_text) {
            return Err(ProviderError::Request("text model unavailable".to_string()));
        }
        Ok(StoryScript {
            title: format!("Story: {}", prompt.prompt),
            scenes: (1..=prompt.num_of_scenes)
                .map(|i| format!("scene {i} of {}", prompt.prompt))
                .collect(),
            image_narrative: format!("illustrated {}", prompt.prompt),
            voice_narrative: format!("Once upon a time, {}", prompt.prompt),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeProviders {
    async fn resolve_voice(
        &self,
        gender: Option<&str>,
        language: &str,
    ) -> Result<String, ProviderError> {
        self.record(ops::VOICE);
        Ok(format!("{language}-{}", gender.unwrap_or("any")))
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        self.record(ops::SPEECH);
        Ok(format!("{voice_id}:{text}").into_bytes())
    }
}

#[async_trait]
impl ImageGenerator for FakeProviders {
    async fn generate_scenes(&self, request: &ImageRequest) -> Result<Vec<String>, ProviderError> {
        self.record(ops::IMAGE);
        if self.with_state(|s| s.fail_images) {
            return Err(ProviderError::Failed {
                request_id: "img-1".to_string(),
                message: "content policy".to_string(),
            });
        }
        Ok((0..request.scenes.len())
            .map(|i| format!("https://img.test/scene-{i}.png"))
            .collect())
    }
}

#[async_trait]
impl VideoGenerator for FakeProviders {
    async fn generate_clip(
        &self,
        scene_index: usize,
        _image_url: &str,
        _prompt: &str,
        _aspect_ratio: AspectRatio,
    ) -> Result<String, ProviderError> {
        self.record(ops::VIDEO);
        let fail = self.with_state(|s| {
            s.video_attempts.push(scene_index);
            match s.video_failures.get_mut(&scene_index) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        });
        if fail {
            return Err(ProviderError::Failed {
                request_id: format!("clip-{scene_index}"),
                message: "rate limited".to_string(),
            });
        }
        Ok(format!("https://video.test/clip-{scene_index}.mp4"))
    }
}

#[async_trait]
impl MediaComposer for FakeProviders {
    async fn concat(&self, clip_urls: &[String]) -> Result<Vec<u8>, ProviderError> {
        self.record(ops::CONCAT);
        if self.with_state(|s| s.empty_merge) {
            return Ok(Vec::new());
        }
        Ok(clip_urls.join("|").into_bytes())
    }

    async fn mix_audio(&self, mut video: Vec<u8>, audio: &[u8]) -> Result<Vec<u8>, ProviderError> {
        self.record(ops::MIX);
        video.extend_from_slice(b"+");
        video.extend_from_slice(audio);
        Ok(video)
    }
}

#[async_trait]
impl ObjectStorage for FakeProviders {
    async fn upload(
        &self,
        _bytes: Vec<u8>,
        path: &str,
        content_hash: &str,
        content_type: &str,
    ) -> Result<String, ProviderError> {
        self.record(ops::UPLOAD);
        let key = object_key(path, content_hash, content_type);
        self.with_state(|s| s.uploads.push(key.clone()));
        Ok(format!("https://cdn.test/{key}"))
    }
}

#[async_trait]
impl ModelInvoker for FakeProviders {
    async fn invoke(
        &self,
        endpoint: &str,
        _input: serde_json::Value,
    ) -> Result<ProviderOutput, ProviderError> {
        self.record(ops::INVOKE);
        if self.with_state(|s| s.fail_invoke) {
            return Err(ProviderError::Failed {
                request_id: "inv-1".to_string(),
                message: "model crashed".to_string(),
            });
        }
        Ok(ProviderOutput::from_data(serde_json::json!({
            "video": { "url": format!("https://provider.test/{endpoint}/out.mp4") }
        })))
    }
}

#[async_trait]
impl MediaFetcher for FakeProviders {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ProviderError> {
        self.record(ops::FETCH);
        if self.with_state(|s| s.empty_fetch) {
            return Ok(Vec::new());
        }
        Ok(url.as_bytes().to_vec())
    }
}

/// Map-backed [`JobLookup`].
#[derive(Debug, Default)]
pub struct StaticJobLookup {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl StaticJobLookup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, job: Job) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(job.job_id.clone(), job);
        }
    }
}

#[async_trait]
impl JobLookup for StaticJobLookup {
    async fn find_job(&self, job_id: &JobId) -> Result<Option<Job>, LookupError> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| LookupError("lookup lock poisoned".to_string()))?;
        Ok(jobs.get(job_id).cloned())
    }
}
