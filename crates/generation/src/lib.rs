//! Generation domain module.
//!
//! Jobs, their tagged request payloads, the user-visible generation records and
//! credit pricing, implemented as deterministic domain logic (no IO, no HTTP, no
//! storage).

pub mod job;
pub mod output;
pub mod payload;
pub mod pricing;
pub mod record;

pub use job::{Job, JobKind, JobStatus, QueuedJob};
pub use output::GenerationOutput;
pub use payload::{
    AspectRatio, EffectRequest, GenerationLibRequest, JobPayload, MediaKind, StoryRequest,
    ValidationError, VoiceOverRequest, MAX_SCENES,
};
pub use pricing::CreditPricing;
pub use record::GenerationRecord;
