//! `clipforge-pipeline`
//!
//! Stage pipeline executors: the per-queue logic that drives one job through the
//! external generation providers to a [`GenerationOutput`].
//!
//! Executors never touch persisted state. They return an output or a typed
//! [`JobFailure`]; reconciling the Job, the record, credits and notifications is the
//! outcome handler's job (in `clipforge-infra`).
//!
//! [`GenerationOutput`]: clipforge_generation::GenerationOutput

pub mod client;
pub mod dispatcher;
pub mod effect;
pub mod failure;
#[cfg(any(test, feature = "test-support"))]
pub mod fakes;
pub mod gateway;
pub mod generation_lib;
pub mod http;
pub mod media;
pub mod progress;
pub mod provider;
pub mod story;

pub use client::{ModelInvoker, PollConfig, PollingInvoker, ProviderClient, ProviderOutput, ProviderStatus};
pub use dispatcher::{JobLookup, LookupError, PipelineDispatcher, PipelineExecutor};
pub use effect::{EffectConfig, EffectExecutor};
pub use failure::{FailureKind, JobFailure};
#[cfg(any(test, feature = "test-support"))]
pub use fakes::FakeProviders;
pub use gateway::{ModelGateway, StoryModels};
pub use generation_lib::GenerationLibExecutor;
pub use http::{HttpMediaFetcher, HttpObjectStorage, HttpProviderClient};
pub use media::FfmpegComposer;
pub use progress::ProgressTicker;
pub use provider::{
    ImageGenerator, ImageRequest, MediaComposer, MediaFetcher, ObjectStorage, ProviderError,
    SpeechSynthesizer, StoryPrompt, StoryScript, TextGenerator, VideoGenerator, content_hash,
    object_key,
};
pub use story::{StoryConfig, StoryExecutor, StoryProviders};
