//! Single-stage effect executor: one model call on the input image.

use std::sync::Arc;

use tracing::{info, instrument};

use clipforge_generation::{EffectRequest, GenerationOutput, QueuedJob};

use crate::client::ModelInvoker;
use crate::failure::JobFailure;
use crate::provider::non_blank;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectConfig {
    /// Nominal length of a generated effect/library clip.
    pub clip_seconds: f64,
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self { clip_seconds: 5.0 }
    }
}

#[derive(Clone)]
pub struct EffectExecutor {
    invoker: Arc<dyn ModelInvoker>,
    config: EffectConfig,
}

impl core::fmt::Debug for EffectExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EffectExecutor")
            .field("config", &self.config)
            .finish()
    }
}

impl EffectExecutor {
    pub fn new(invoker: Arc<dyn ModelInvoker>, config: EffectConfig) -> Self {
        Self { invoker, config }
    }

    #[instrument(skip_all, fields(job_id = %job.job_id, effect = %request.effect_id))]
    pub async fn run(
        &self,
        job: &QueuedJob,
        request: &EffectRequest,
    ) -> Result<GenerationOutput, JobFailure> {
        let input = serde_json::json!({
            "imageUrl": request.image_url,
            "prompt": request.prompt,
        });
        let out = self.invoker.invoke(&request.effect_id, input).await?;
        let url = non_blank(out.first_url()?, "effect result url")?;

        info!(result_url = %url, "effect generated");
        Ok(GenerationOutput::new(url)
            .with_thumbnail(request.image_url.clone())
            .with_duration(self.config.clip_seconds))
    }
}
