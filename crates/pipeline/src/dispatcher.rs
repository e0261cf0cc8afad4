//! Dispatch boundary: validate, check idempotency, route by payload kind.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use clipforge_core::JobId;
use clipforge_events::RealtimeChannel;
use clipforge_generation::{GenerationOutput, Job, JobPayload, JobStatus, QueuedJob};

use crate::effect::EffectExecutor;
use crate::failure::JobFailure;
use crate::generation_lib::GenerationLibExecutor;
use crate::progress::ProgressTicker;
use crate::story::StoryExecutor;

const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Processing function bound to a queue.
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    async fn execute(&self, job: &QueuedJob) -> Result<GenerationOutput, JobFailure>;
}

#[async_trait]
impl<E> PipelineExecutor for Arc<E>
where
    E: PipelineExecutor + ?Sized,
{
    async fn execute(&self, job: &QueuedJob) -> Result<GenerationOutput, JobFailure> {
        (**self).execute(job).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job lookup failed: {0}")]
pub struct LookupError(pub String);

/// Read access to persisted jobs, for the idempotency check.
#[async_trait]
pub trait JobLookup: Send + Sync {
    async fn find_job(&self, job_id: &JobId) -> Result<Option<Job>, LookupError>;
}

/// Routes each job to its kind's executor, wrapped in a progress ticker.
#[derive(Clone)]
pub struct PipelineDispatcher {
    story: StoryExecutor,
    effect: EffectExecutor,
    generation_lib: GenerationLibExecutor,
    lookup: Arc<dyn JobLookup>,
    realtime: Arc<dyn RealtimeChannel>,
    progress_interval: Duration,
}

impl core::fmt::Debug for PipelineDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipelineDispatcher")
            .field("story", &self.story)
            .field("effect", &self.effect)
            .field("generation_lib", &self.generation_lib)
            .field("progress_interval", &self.progress_interval)
            .finish()
    }
}

impl PipelineDispatcher {
    pub fn new(
        story: StoryExecutor,
        effect: EffectExecutor,
        generation_lib: GenerationLibExecutor,
        lookup: Arc<dyn JobLookup>,
        realtime: Arc<dyn RealtimeChannel>,
    ) -> Self {
        Self {
            story,
            effect,
            generation_lib,
            lookup,
            realtime,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// `Some(output)` when the job already completed (answer from cache);
    /// an error when it already failed.
    async fn check_idempotency(&self, job_id: &JobId) -> Result<Option<GenerationOutput>, JobFailure> {
        let existing = match self.lookup.find_job(job_id).await {
            Ok(existing) => existing,
            Err(e) => {
                // Providers tolerate a repeated call; a lookup outage must not fail the job.
                warn!(job_id = %job_id, error = %e, "idempotency lookup failed; executing");
                return Ok(None);
            }
        };

        match existing {
            Some(job) if job.status == JobStatus::Completed => match job.result {
                Some(output) => {
                    info!(job_id = %job_id, "job already completed; returning cached result");
                    Ok(Some(output))
                }
                None => Err(JobFailure::persistence(format!(
                    "job {job_id} is completed but has no stored result"
                ))),
            },
            Some(job) if job.status == JobStatus::Failed => Err(JobFailure::idempotency_conflict(
                format!("job {job_id} already failed"),
            )),
            Some(_) => Ok(None),
            None => {
                debug!(job_id = %job_id, "no persisted job found for queued entry");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl PipelineExecutor for PipelineDispatcher {
    #[instrument(skip_all, fields(job_id = %job.job_id, kind = %job.kind()))]
    async fn execute(&self, job: &QueuedJob) -> Result<GenerationOutput, JobFailure> {
        job.payload.validate()?;

        if let Some(cached) = self.check_idempotency(&job.job_id).await? {
            return Ok(cached);
        }

        let ticker = ProgressTicker::spawn(
            self.realtime.clone(),
            job.job_id.clone(),
            job.user_id,
            job.kind(),
            self.progress_interval,
        );

        let result = match &job.payload {
            JobPayload::Story(request) => self.story.run(job, request).await,
            JobPayload::Effect(request) => self.effect.run(job, request).await,
            JobPayload::GenerationLib(request) => self.generation_lib.run(job, request).await,
        };

        let reached = ticker.stop().await;
        debug!(progress = reached, ok = result.is_ok(), "execution finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::EffectConfig;
    use crate::failure::FailureKind;
    use crate::fakes::{FakeProviders, StaticJobLookup};
    use crate::story::StoryConfig;
    use chrono::Utc;
    use clipforge_core::{RecordId, UserId};
    use clipforge_events::{InMemoryRealtimeHub, user_channel};
    use clipforge_generation::{AspectRatio, EffectRequest, StoryRequest};

    struct Harness {
        fakes: Arc<FakeProviders>,
        lookup: Arc<StaticJobLookup>,
        hub: Arc<InMemoryRealtimeHub>,
        dispatcher: PipelineDispatcher,
    }

    fn harness() -> Harness {
        let fakes = FakeProviders::new();
        let lookup = StaticJobLookup::new();
        let hub = Arc::new(InMemoryRealtimeHub::new());
        let dispatcher = PipelineDispatcher::new(
            StoryExecutor::new(fakes.story_providers(), StoryConfig::default()),
            EffectExecutor::new(fakes.clone(), EffectConfig::default()),
            GenerationLibExecutor::new(
                fakes.clone(),
                fakes.clone(),
                fakes.clone(),
                EffectConfig::default(),
            ),
            lookup.clone(),
            hub.clone(),
        )
        .with_progress_interval(Duration::from_millis(5));
        Harness {
            fakes,
            lookup,
            hub,
            dispatcher,
        }
    }

    fn story_payload(scenes: u8) -> JobPayload {
        JobPayload::Story(StoryRequest {
            prompt: "a fox learns to fly".to_string(),
            num_of_scenes: scenes,
            style: None,
            aspect_ratio: AspectRatio::Landscape,
            voice_over: None,
        })
    }

    fn persisted(payload: JobPayload) -> Job {
        Job::new(
            JobId::generate(),
            UserId::new(),
            RecordId::new(),
            payload,
            30,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn routes_story_payload_to_story_executor() {
        let h = harness();
        let job = persisted(story_payload(3));
        h.lookup.insert(job.clone());

        let out = h.dispatcher.execute(&QueuedJob::from_job(&job)).await.unwrap();
        assert!(!out.result_url.is_empty());
        assert_eq!(h.fakes.calls("text"), 1);
        assert_eq!(h.fakes.calls("invoke"), 0);
    }

    #[tokio::test]
    async fn routes_effect_payload_to_effect_executor() {
        let h = harness();
        let job = persisted(JobPayload::Effect(EffectRequest {
            effect_id: "effects/zoom".to_string(),
            image_url: "https://img.test/a.png".to_string(),
            prompt: None,
        }));

        h.dispatcher.execute(&QueuedJob::from_job(&job)).await.unwrap();
        assert_eq!(h.fakes.calls("invoke"), 1);
        assert_eq!(h.fakes.calls("text"), 0);
    }

    #[tokio::test]
    async fn invalid_payload_is_a_client_failure_without_provider_calls() {
        let h = harness();
        let job = persisted(story_payload(0));

        let err = h.dispatcher.execute(&QueuedJob::from_job(&job)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Client);
        assert_eq!(h.fakes.total_calls(), 0);
    }

    #[tokio::test]
    async fn completed_job_returns_cached_result_without_provider_calls() {
        let h = harness();
        let mut job = persisted(story_payload(2));
        job.complete(GenerationOutput::new("https://cdn.test/cached.mp4"), Utc::now())
            .unwrap();
        h.lookup.insert(job.clone());

        let out = h.dispatcher.execute(&QueuedJob::from_job(&job)).await.unwrap();
        assert_eq!(out.result_url, "https://cdn.test/cached.mp4");
        assert_eq!(h.fakes.total_calls(), 0);
    }

    #[tokio::test]
    async fn failed_job_is_rejected_as_idempotency_conflict() {
        let h = harness();
        let mut job = persisted(story_payload(2));
        job.fail("provider_error: boom", Utc::now()).unwrap();
        h.lookup.insert(job.clone());

        let err = h.dispatcher.execute(&QueuedJob::from_job(&job)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::IdempotencyConflict);
        assert_eq!(h.fakes.total_calls(), 0);
    }

    #[tokio::test]
    async fn progress_never_reaches_100_during_execution() {
        let h = harness();
        let job = persisted(story_payload(1));
        let mut sub = h.hub.subscribe(user_channel(job.user_id));

        h.dispatcher.execute(&QueuedJob::from_job(&job)).await.unwrap();

        for msg in sub.drain() {
            assert_eq!(msg.event, "job:progress");
            assert!(msg.payload["progress"].as_u64().unwrap() < 100);
        }
    }
}
