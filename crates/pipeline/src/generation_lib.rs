//! Generation-library executor: model call → fetch produced media → re-host it.

use std::sync::Arc;

use tracing::{info, instrument};

use clipforge_generation::{GenerationLibRequest, GenerationOutput, MediaKind, QueuedJob};

use crate::client::ModelInvoker;
use crate::effect::EffectConfig;
use crate::failure::JobFailure;
use crate::provider::{MediaFetcher, ObjectStorage, content_hash, non_blank, non_empty};

#[derive(Clone)]
pub struct GenerationLibExecutor {
    invoker: Arc<dyn ModelInvoker>,
    fetcher: Arc<dyn MediaFetcher>,
    storage: Arc<dyn ObjectStorage>,
    config: EffectConfig,
}

impl core::fmt::Debug for GenerationLibExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GenerationLibExecutor")
            .field("config", &self.config)
            .finish()
    }
}

impl GenerationLibExecutor {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        fetcher: Arc<dyn MediaFetcher>,
        storage: Arc<dyn ObjectStorage>,
        config: EffectConfig,
    ) -> Self {
        Self {
            invoker,
            fetcher,
            storage,
            config,
        }
    }

    #[instrument(skip_all, fields(job_id = %job.job_id, model = %request.model))]
    pub async fn run(
        &self,
        job: &QueuedJob,
        request: &GenerationLibRequest,
    ) -> Result<GenerationOutput, JobFailure> {
        let input = serde_json::json!({
            "prompt": request.prompt,
            "imageUrl": request.image_url,
        });
        let out = self.invoker.invoke(&request.model, input).await?;
        let source = out.first_url()?;

        let bytes = non_empty(self.fetcher.fetch(&source).await?, "generated media")?;
        let hash = content_hash(&bytes);
        let content_type = match request.media {
            MediaKind::Image => "image/png",
            MediaKind::Video => "video/mp4",
        };
        let url = non_blank(
            self.storage
                .upload(bytes, &format!("library/{}", job.user_id), &hash, content_type)
                .await?,
            "library upload url",
        )?;

        info!(result_url = %url, source = %source, "library media generated");

        let output = GenerationOutput::new(url.clone());
        Ok(match request.media {
            MediaKind::Image => output.with_thumbnail(url),
            MediaKind::Video => {
                let output = output.with_duration(self.config.clip_seconds);
                match &request.image_url {
                    Some(image) => output.with_thumbnail(image.clone()),
                    None => output,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureKind;
    use crate::fakes::{FakeProviders, ops};
    use clipforge_core::{JobId, RecordId, UserId};
    use clipforge_generation::JobPayload;

    fn job(media: MediaKind) -> (QueuedJob, GenerationLibRequest) {
        let request = GenerationLibRequest {
            model: "flux/dev".to_string(),
            prompt: "neon city".to_string(),
            image_url: None,
            media,
        };
        let job = QueuedJob {
            job_id: JobId::generate(),
            user_id: UserId::new(),
            record_id: RecordId::new(),
            payload: JobPayload::GenerationLib(request.clone()),
            restart_reconciled: false,
        };
        (job, request)
    }

    fn executor(fakes: &Arc<FakeProviders>) -> GenerationLibExecutor {
        GenerationLibExecutor::new(
            fakes.clone(),
            fakes.clone(),
            fakes.clone(),
            EffectConfig::default(),
        )
    }

    #[tokio::test]
    async fn produced_media_is_rehosted_under_its_content_hash() {
        let fakes = FakeProviders::new();
        let (job, request) = job(MediaKind::Image);

        let out = executor(&fakes).run(&job, &request).await.unwrap();

        assert_eq!(fakes.calls(ops::INVOKE), 1);
        assert_eq!(fakes.calls(ops::FETCH), 1);
        let uploads = fakes.uploads();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].starts_with(&format!("library/{}/", job.user_id)));
        assert!(uploads[0].ends_with(".png"));
        assert_eq!(out.thumbnail.as_deref(), Some(out.result_url.as_str()));
    }

    #[tokio::test]
    async fn empty_download_is_a_provider_failure() {
        let fakes = FakeProviders::new();
        fakes.empty_fetch();
        let (job, request) = job(MediaKind::Video);

        let err = executor(&fakes).run(&job, &request).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Provider);
        assert_eq!(fakes.calls(ops::UPLOAD), 0);
    }
}
